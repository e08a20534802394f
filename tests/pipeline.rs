//! End-to-end ingestion and retrieval over in-memory collaborators.
//!
//! Fixtures are built in-process: PDFs with `lopdf`, DOCX with `zip`.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::sync::Arc;

use course_context::config::{parse_config, Config};
use course_context::context::AppContext;
use course_context::embedding::HashProvider;
use course_context::error::RetrievalError;
use course_context::ingest::Ingestor;
use course_context::manage::CourseMaterials;
use course_context::models::PageOrTimestamp;
use course_context::object_store::MemoryObjectStore;
use course_context::retrieval::Retriever;
use course_context::store::memory::{MemoryAuditLog, MemoryVectorStore};

const LONG_PAGE_ONE: &str = "Finite state machines model sequential logic circuits. \
A Mealy machine produces outputs that depend on the current state and the inputs, \
while a Moore machine produces outputs that depend only on the current state. \
Both are drawn as state transition diagrams with labelled edges.";

const SHORT_PAGE_TWO: &str = "Figure 3.";

const LONG_PAGE_THREE: &str = "Karnaugh maps simplify boolean expressions by grouping adjacent cells. \
Each group must contain a power of two cells and may wrap around the edges of the map. \
Larger groups eliminate more variables and give simpler sum of products expressions.";

fn config() -> Config {
    parse_config(
        r#"
[db]
path = "unused.sqlite"

[storage]
backend = "s3"
bucket = "course-materials"

[chunking]
length_unit = "chars"

[retrieval]
defer_monitoring = false
"#,
    )
    .unwrap()
}

struct Env {
    objects: Arc<MemoryObjectStore>,
    vectors: Arc<MemoryVectorStore>,
    log: Arc<MemoryAuditLog>,
    ctx: Arc<AppContext>,
}

fn env() -> Env {
    let objects = Arc::new(MemoryObjectStore::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let log = Arc::new(MemoryAuditLog::new());
    let ctx = Arc::new(AppContext::new(
        config(),
        objects.clone(),
        vectors.clone(),
        log.clone(),
        Arc::new(HashProvider::new(256)),
    ));
    Env {
        objects,
        vectors,
        log,
        ctx,
    }
}

/// A PDF with one text line per sentence on each page.
fn pdf_with_pages(pages: &[&str]) -> Vec<u8> {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 11.into()]),
            Operation::new("Td", vec![50.into(), 740.into()]),
        ];
        for sentence in text.split_inclusive(". ") {
            operations.push(Operation::new("Tj", vec![Object::string_literal(sentence)]));
            operations.push(Operation::new("Td", vec![0.into(), (-14).into()]));
        }
        operations.push(Operation::new("ET", vec![]));

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages.len() as i64,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).unwrap();
    buf
}

fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<w:p><w:r><w:t>{}</w:t></w:r></w:p>", p))
        .collect();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{}</w:body></w:document>"#,
        body
    );
    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        zip.start_file(
            "word/document.xml",
            zip::write::SimpleFileOptions::default(),
        )
        .unwrap();
        zip.write_all(xml.as_bytes()).unwrap();
        zip.finish().unwrap();
    }
    buf
}

fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn pdf_short_pages_are_dropped_and_thumbnail_uploaded() {
    let env = env();
    let pdf = pdf_with_pages(&[LONG_PAGE_ONE, SHORT_PAGE_TWO, LONG_PAGE_THREE]);
    env.objects.insert("ece120/lecture3.pdf", pdf);

    let report = Ingestor::new(env.ctx.clone()).unwrap()
        .bulk_ingest(&keys(&["ece120/lecture3.pdf"]), "ece120")
        .await;
    assert_eq!(report.success_ingest, vec!["ece120/lecture3.pdf"], "{:?}", report.outcomes);

    let records = env.vectors.records();
    let pages: HashSet<PageOrTimestamp> = records
        .iter()
        .map(|r| r.metadata.pagenumber_or_timestamp.clone())
        .collect();
    assert_eq!(
        pages,
        HashSet::from([PageOrTimestamp::Page(1), PageOrTimestamp::Page(3)])
    );
    assert!(records.iter().all(|r| r.text.chars().count() > 50));
    assert!(records.iter().all(|r| r.metadata.readable_filename == "lecture3"));
    assert!(records.iter().any(|r| r.text.contains("Mealy")));

    let thumb = env
        .objects
        .get("ece120/lecture3-pg1-thumb.png")
        .expect("thumbnail uploaded");
    assert_eq!(thumb.content_type, "image/png");
    assert_eq!(&thumb.bytes[..8], b"\x89PNG\r\n\x1a\n");

    assert_eq!(env.log.rows().len(), records.len());
}

#[tokio::test]
async fn docx_ingests_with_blank_position() {
    let env = env();
    env.objects.insert(
        "cs225/syllabus.docx",
        docx_with_paragraphs(&[
            "CS 225 covers data structures including lists, trees, heaps and hash tables.",
            "Grading is based on machine problems, labs and three exams.",
        ]),
    );

    let report = Ingestor::new(env.ctx.clone()).unwrap()
        .bulk_ingest(&keys(&["cs225/syllabus.docx"]), "cs225")
        .await;
    assert_eq!(report.success_ingest.len(), 1, "{:?}", report.outcomes);

    let records = env.vectors.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].text.contains("hash tables"));
    let meta = serde_json::to_value(&records[0].metadata).unwrap();
    assert_eq!(meta["pagenumber_or_timestamp"], "");
    assert_eq!(meta["readable_filename"], "syllabus");
    assert_eq!(meta["s3_path"], "cs225/syllabus.docx");
}

#[tokio::test]
async fn srt_chunks_carry_timestamps() {
    let env = env();
    let srt = "1\n00:00:01,000 --> 00:00:04,000\nWelcome back to lecture twelve on graph algorithms.\n\n\
2\n00:00:04,500 --> 00:00:09,000\nToday we cover breadth first search and depth first search.\n";
    env.objects.insert("cs225/lecture12.srt", srt);

    let report = Ingestor::new(env.ctx.clone()).unwrap()
        .bulk_ingest(&keys(&["cs225/lecture12.srt"]), "cs225")
        .await;
    assert_eq!(report.success_ingest.len(), 1, "{:?}", report.outcomes);

    let records = env.vectors.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].metadata.pagenumber_or_timestamp,
        PageOrTimestamp::Label("00:00:01".into())
    );
}

#[tokio::test]
async fn reingesting_duplicates_chunks() {
    let env = env();
    env.objects.insert("cs225/notes.txt", LONG_PAGE_ONE);
    let ingestor = Ingestor::new(env.ctx.clone()).unwrap();

    ingestor.bulk_ingest(&keys(&["cs225/notes.txt"]), "cs225").await;
    let first = env.vectors.len();
    ingestor.bulk_ingest(&keys(&["cs225/notes.txt"]), "cs225").await;

    assert_eq!(env.vectors.len(), first * 2);
    let ids: BTreeSet<String> = env.vectors.records().into_iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), first * 2);
}

#[tokio::test]
async fn retrieval_is_scoped_to_course_and_ranked() {
    let env = env();
    env.objects.insert("ece120/fsm.txt", LONG_PAGE_ONE);
    env.objects.insert("ece120/kmaps.txt", LONG_PAGE_THREE);
    env.objects.insert("cs225/fsm.txt", LONG_PAGE_ONE);
    let ingestor = Ingestor::new(env.ctx.clone()).unwrap();
    ingestor
        .bulk_ingest(&keys(&["ece120/fsm.txt", "ece120/kmaps.txt"]), "ece120")
        .await;
    ingestor.bulk_ingest(&keys(&["cs225/fsm.txt"]), "cs225").await;

    let retriever = Retriever::new(env.ctx.clone());
    let hits = retriever
        .search("What is a Mealy machine state diagram?", "ece120", Some(4))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.course_name == "ece120"));
    assert_eq!(hits[0].s3_path, "ece120/fsm.txt");

    let top1 = retriever
        .search("Karnaugh map groups", "ece120", Some(1))
        .await
        .unwrap();
    assert_eq!(top1.len(), 1);
    assert_eq!(top1[0].readable_filename, "kmaps");

    assert_eq!(env.log.queries().len(), 2);
}

#[tokio::test]
async fn empty_course_query_is_rejected() {
    let env = env();
    let err = Retriever::new(env.ctx.clone())
        .search("anything", "", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RetrievalError::InvalidRequest(_)));
    assert!(env.log.queries().is_empty());
}

#[tokio::test]
async fn mixed_batch_reports_each_file() {
    let env = env();
    env.objects.insert("ece120/notes.txt", LONG_PAGE_THREE);
    env.objects.insert("ece120/slides.pptx", b"not a zip archive".to_vec());
    env.objects.insert("ece120/grades.csv", "a,b,c");

    let report = Ingestor::new(env.ctx.clone()).unwrap()
        .bulk_ingest(
            &keys(&["ece120/notes.txt", "ece120/slides.pptx", "ece120/grades.csv"]),
            "ece120",
        )
        .await;

    assert_eq!(report.success_ingest, vec!["ece120/notes.txt"]);
    assert_eq!(
        report.failure_ingest,
        vec!["ece120/slides.pptx", "ece120/grades.csv"]
    );
    let json = serde_json::to_value(&report).unwrap();
    let fields = json.as_object().unwrap();
    assert_eq!(fields.len(), 2);
    assert_eq!(fields["success_ingest"], serde_json::json!(["ece120/notes.txt"]));
    assert_eq!(
        fields["failure_ingest"],
        serde_json::json!(["ece120/slides.pptx", "ece120/grades.csv"])
    );
}

#[tokio::test]
async fn delete_document_removes_it_from_search() {
    let env = env();
    env.objects.insert("ece120/fsm.txt", LONG_PAGE_ONE);
    env.objects.insert("ece120/kmaps.txt", LONG_PAGE_THREE);
    Ingestor::new(env.ctx.clone()).unwrap()
        .bulk_ingest(&keys(&["ece120/fsm.txt", "ece120/kmaps.txt"]), "ece120")
        .await;

    let materials = CourseMaterials::new(env.ctx.clone());
    assert_eq!(materials.list_files("ece120").await.unwrap().len(), 2);

    materials
        .delete_document("ece120", "ece120/fsm.txt")
        .await
        .unwrap();

    let files = materials.list_files("ece120").await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].s3_path, "ece120/kmaps.txt");

    let hits = Retriever::new(env.ctx.clone())
        .search("Mealy machine", "ece120", None)
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.s3_path != "ece120/fsm.txt"));
}
