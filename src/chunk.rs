//! Sentence-boundary text chunker.
//!
//! Splits extracted text into [`Chunk`]s no longer than `chunk_size` length
//! units, carrying up to `chunk_overlap` units from the end of one chunk
//! into the start of the next so context survives the boundary.
//!
//! Splitting is recursive over a fixed separator list: sentences (`". "`)
//! first, then words (`" "`), then single characters for pathological
//! input with no whitespace. Pieces are merged greedily back up to the size
//! limit. Chunks of `min_chunk_chars` characters or fewer are discarded.
//!
//! Boundaries are a pure function of the input text and parameters. Chunk
//! ids are fresh UUIDs, so re-chunking the same text yields new chunks.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::Path;
use uuid::Uuid;

use crate::config::{ChunkingConfig, LengthUnit};
use crate::error::ChunkingError;
use crate::models::{Chunk, ChunkMetadata};

/// Separators tried in order. The empty separator splits into characters.
const SEPARATORS: [&str; 3] = [". ", " ", ""];

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Measures text length in the unit chunk sizes are expressed in.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Counts Unicode scalar values.
pub struct CharCounter;

impl TokenCounter for CharCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count()
    }
}

/// Estimates tokens as characters divided by four, rounded up.
pub struct ApproxTokenCounter;

impl TokenCounter for ApproxTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Counts tokens with a Hugging Face tokenizer, so chunk sizes match what
/// the embedding model sees.
pub struct TokenizerCounter {
    tokenizer: tokenizers::Tokenizer,
}

impl TokenizerCounter {
    /// Load from a local `tokenizer.json`, or from the Hugging Face Hub when
    /// `source` is not an existing file.
    pub fn load(source: &str) -> Result<Self> {
        let mut tokenizer = if Path::new(source).is_file() {
            tokenizers::Tokenizer::from_file(source)
        } else {
            tokenizers::Tokenizer::from_pretrained(source, None)
        }
        .map_err(|e| anyhow!("Load tokenizer '{}': {}", source, e))?;
        tokenizer
            .with_truncation(None)
            .map_err(|e| anyhow!("Configure tokenizer '{}': {}", source, e))?;
        tokenizer.with_padding(None);
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for TokenizerCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len(),
            Err(_) => ApproxTokenCounter.count(text),
        }
    }
}

pub fn counter_for(config: &ChunkingConfig) -> Result<Box<dyn TokenCounter>> {
    Ok(match config.unit() {
        LengthUnit::Tokens => {
            let source = config.tokenizer.as_deref().ok_or_else(|| {
                anyhow!("chunking.tokenizer must be set when chunking.length_unit is 'tokens'")
            })?;
            Box::new(TokenizerCounter::load(source)?)
        }
        LengthUnit::ApproxTokens => Box::new(ApproxTokenCounter),
        LengthUnit::Chars => Box::new(CharCounter),
    })
}

/// Recursive separator splitter with overlapping merge.
pub struct TextSplitter<'a> {
    chunk_size: usize,
    chunk_overlap: usize,
    counter: &'a dyn TokenCounter,
}

impl<'a> TextSplitter<'a> {
    pub fn new(chunk_size: usize, chunk_overlap: usize, counter: &'a dyn TokenCounter) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            counter,
        }
    }

    /// Split `text` into trimmed, non-empty pieces.
    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let idx = separators
            .iter()
            .position(|s| s.is_empty() || text.contains(s))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(idx).copied().unwrap_or("");
        let remaining = separators.get(idx + 1..).unwrap_or(&[]);

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut out = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();
        for piece in splits {
            if self.counter.count(piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                out.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if remaining.is_empty() {
                out.push(piece.trim().to_string());
            } else {
                out.extend(self.split_with(piece, remaining));
            }
        }
        if !fitting.is_empty() {
            out.extend(self.merge(&fitting, separator));
        }
        out.retain(|s| !s.is_empty());
        out
    }

    /// Greedily join pieces up to `chunk_size`, keeping a tail of at most
    /// `chunk_overlap` units as the head of the next chunk.
    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_len = self.counter.count(separator);
        let mut docs = Vec::new();
        let mut current: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = self.counter.count(piece);
            let joined_len = |current: &VecDeque<&str>| if current.is_empty() { 0 } else { sep_len };

            if total + len + joined_len(&current) > self.chunk_size && !current.is_empty() {
                if let Some(doc) = join_pieces(&current, separator) {
                    docs.push(doc);
                }
                while total > self.chunk_overlap
                    || (total > 0 && total + len + joined_len(&current) > self.chunk_size)
                {
                    let had_followers = current.len() > 1;
                    let Some(first) = current.pop_front() else {
                        break;
                    };
                    let removed = self.counter.count(first) + if had_followers { sep_len } else { 0 };
                    total = total.saturating_sub(removed);
                }
            }

            current.push_back(piece);
            total += len + if current.len() > 1 { sep_len } else { 0 };
        }

        if let Some(doc) = join_pieces(&current, separator) {
            docs.push(doc);
        }
        docs
    }
}

fn join_pieces(pieces: &VecDeque<&str>, separator: &str) -> Option<String> {
    let joined = pieces.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Splits segment texts into chunks and attaches their metadata.
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_chars: usize,
    counter: Box<dyn TokenCounter>,
}

impl Chunker {
    pub fn new(config: &ChunkingConfig) -> Result<Self> {
        Ok(Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            min_chunk_chars: config.min_chunk_chars,
            counter: counter_for(config)?,
        })
    }

    /// Chunk each text, tagging every piece with the metadata at the same
    /// index. Fails before producing anything if the lengths differ.
    pub fn chunk(
        &self,
        texts: &[String],
        metadatas: &[ChunkMetadata],
    ) -> Result<Vec<Chunk>, ChunkingError> {
        if texts.len() != metadatas.len() {
            return Err(ChunkingError::LengthMismatch {
                texts: texts.len(),
                metadatas: metadatas.len(),
            });
        }

        let splitter = TextSplitter::new(self.chunk_size, self.chunk_overlap, self.counter.as_ref());
        let mut chunks = Vec::new();
        for (text, metadata) in texts.iter().zip(metadatas) {
            for piece in splitter.split(text) {
                if piece.chars().count() > self.min_chunk_chars {
                    chunks.push(make_chunk(piece, metadata));
                }
            }
        }
        Ok(chunks)
    }
}

fn make_chunk(text: String, metadata: &ChunkMetadata) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        hash: hash_text(&text),
        text,
        metadata: metadata.clone(),
    }
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
