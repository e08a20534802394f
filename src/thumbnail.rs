//! First-page PDF thumbnails.
//!
//! With the `pdf-render` feature, page 1 is rasterized by PDFium (loaded
//! from the system library path at runtime). Without it, or when PDFium
//! cannot be loaded or fails on the document, the thumbnail is built from
//! what `lopdf` can see: the first JPEG (`DCTDecode`) image embedded in
//! page 1 when there is one, otherwise a blank canvas with the page's
//! aspect ratio. Every fallback is logged at `warn`.
//!
//! The output is always a PNG at twice the page's point size, capped at
//! [`MAX_EDGE`] pixels.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId};
use tracing::warn;

use crate::error::ExtractError;

const ZOOM: f32 = 2.0;
const MAX_EDGE: u32 = 2048;
/// US Letter, used when page 1 has no readable MediaBox.
const DEFAULT_MEDIA_BOX: (f32, f32) = (612.0, 792.0);

/// Render page 1 of the PDF in `bytes` to PNG.
pub fn render_first_page(bytes: &[u8]) -> Result<Vec<u8>, ExtractError> {
    let doc = Document::load_mem(bytes).map_err(|e| ExtractError::Thumbnail(e.to_string()))?;
    let page_id = doc
        .get_pages()
        .into_iter()
        .next()
        .map(|(_, id)| id)
        .ok_or_else(|| ExtractError::Thumbnail("document has no pages".to_string()))?;

    let (width, height) = canvas_size(page_size(&doc, page_id));
    let image = match rasterize(bytes, width, height) {
        Ok(image) => image,
        Err(reason) => fallback(&doc, page_id, width, height, &reason),
    };

    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ExtractError::Thumbnail(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(feature = "pdf-render")]
fn rasterize(bytes: &[u8], width: u32, height: u32) -> Result<DynamicImage, String> {
    use image::RgbaImage;
    use pdfium_render::prelude::*;

    let bindings = Pdfium::bind_to_system_library().map_err(|e| e.to_string())?;
    let pdfium = Pdfium::new(bindings);
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| e.to_string())?;
    let page = document.pages().get(0).map_err(|e| e.to_string())?;
    let config = PdfRenderConfig::new()
        .set_target_width(width as _)
        .set_maximum_height(height as _);
    let bitmap = page.render_with_config(&config).map_err(|e| e.to_string())?;
    RgbaImage::from_raw(
        bitmap.width() as u32,
        bitmap.height() as u32,
        bitmap.as_rgba_bytes(),
    )
    .map(DynamicImage::ImageRgba8)
    .ok_or_else(|| "rendered bitmap has an unexpected size".to_string())
}

#[cfg(not(feature = "pdf-render"))]
fn rasterize(_bytes: &[u8], _width: u32, _height: u32) -> Result<DynamicImage, String> {
    Err("built without the pdf-render feature".to_string())
}

/// Thumbnail from page 1's embedded JPEG, or a blank canvas.
fn fallback(
    doc: &Document,
    page_id: ObjectId,
    width: u32,
    height: u32,
    reason: &str,
) -> DynamicImage {
    let embedded = first_jpeg(doc, page_id).and_then(|jpeg| {
        image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg)
            .map(|img| img.thumbnail(width, height))
            .ok()
    });
    match embedded {
        Some(image) => {
            warn!(reason, "page not rasterized; thumbnail taken from embedded image");
            image
        }
        None => {
            warn!(reason, "page not rasterized and no embedded image; thumbnail is blank");
            blank(width, height)
        }
    }
}

fn blank(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
}

fn canvas_size((w, h): (f32, f32)) -> (u32, u32) {
    let (w, h) = (w * ZOOM, h * ZOOM);
    let scale = (MAX_EDGE as f32 / w.max(h)).min(1.0);
    (
        ((w * scale).round() as u32).max(1),
        ((h * scale).round() as u32).max(1),
    )
}

fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let media_box = doc
        .get_dictionary(page_id)
        .ok()
        .and_then(|page| page.get(b"MediaBox").ok())
        .and_then(|obj| resolve(doc, obj))
        .and_then(|obj| obj.as_array().ok());
    let Some(values) = media_box else {
        return DEFAULT_MEDIA_BOX;
    };
    let nums: Vec<f32> = values.iter().filter_map(number).collect();
    match nums.as_slice() {
        [x0, y0, x1, y1] if (x1 - x0).abs() > 1.0 && (y1 - y0).abs() > 1.0 => {
            ((x1 - x0).abs(), (y1 - y0).abs())
        }
        _ => DEFAULT_MEDIA_BOX,
    }
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match resolve(doc, obj)? {
        Object::Dictionary(dict) => Some(dict),
        _ => None,
    }
}

/// Raw bytes of the first JPEG image XObject on the page.
fn first_jpeg(doc: &Document, page_id: ObjectId) -> Option<&[u8]> {
    let page = doc.get_dictionary(page_id).ok()?;
    let resources = resolve_dict(doc, page.get(b"Resources").ok()?)?;
    let xobjects = resolve_dict(doc, resources.get(b"XObject").ok()?)?;

    xobjects.iter().find_map(|(_, obj)| {
        let Object::Stream(stream) = resolve(doc, obj)? else {
            return None;
        };
        let is_image = matches!(
            stream.dict.get(b"Subtype"),
            Ok(Object::Name(name)) if name.as_slice() == b"Image"
        );
        let is_jpeg = match stream.dict.get(b"Filter") {
            Ok(Object::Name(name)) => name.as_slice() == b"DCTDecode",
            Ok(Object::Array(filters)) => {
                filters.len() == 1
                    && matches!(&filters[0], Object::Name(name) if name.as_slice() == b"DCTDecode")
            }
            _ => false,
        };
        (is_image && is_jpeg).then_some(stream.content.as_slice())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn one_page_pdf(media_box: Vec<Object>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let content_id = doc.add_object(lopdf::Stream::new(dictionary! {}, Vec::new()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => media_box,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
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

    #[test]
    fn blank_page_renders_png_at_double_size() {
        let pdf = one_page_pdf(vec![0.into(), 0.into(), 300.into(), 400.into()]);
        let png = render_first_page(&pdf).unwrap();
        let img = image::load_from_memory_with_format(&png, ImageFormat::Png).unwrap();
        assert_eq!((img.width(), img.height()), (600, 800));
    }

    #[test]
    fn large_page_is_capped() {
        let pdf = one_page_pdf(vec![0.into(), 0.into(), 5000.into(), 2500.into()]);
        let png = render_first_page(&pdf).unwrap();
        let img = image::load_from_memory(&png).unwrap();
        assert_eq!(img.width(), MAX_EDGE);
        assert_eq!(img.height(), MAX_EDGE / 2);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(
            render_first_page(b"%PDF-garbage"),
            Err(ExtractError::Thumbnail(_))
        ));
    }

    #[cfg(not(feature = "pdf-render"))]
    #[test]
    fn rasterizer_reports_missing_feature() {
        let err = rasterize(b"%PDF-1.5", 10, 10).unwrap_err();
        assert!(err.contains("pdf-render"));
    }

    #[test]
    fn canvas_size_never_zero() {
        assert_eq!(canvas_size((0.1, 0.1)), (1, 1));
    }
}
