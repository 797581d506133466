//! Page-level PDF plumbing on top of lopdf.
//!
//! Scan batches are images wrapped in PDF pages. The pipeline needs four
//! things from them: the number of pages, a raster of each page, a
//! standalone copy of a single page, and documents assembled from pages of
//! other documents in a chosen order. Page content streams are copied
//! byte-for-byte when pages move between documents.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use fax::decoder::{decode_g3, decode_g4, pels};
use fax::Color;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use tracing::debug;

use crate::error::{GradingError, Result};
use crate::ledger::write_atomic;

/// Page attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Guard against cyclic `/Parent` chains and reference loops.
const MAX_TREE_DEPTH: usize = 64;

/// A loaded PDF with its pages indexed from zero.
pub struct PdfBundle {
    doc: Document,
    page_ids: Vec<ObjectId>,
    origin: PathBuf,
}

impl PdfBundle {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut bundle = Self::from_bytes(&bytes)?;
        bundle.origin = path.to_path_buf();
        Ok(bundle)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_document(Document::load_mem(bytes)?))
    }

    pub fn from_document(doc: Document) -> Self {
        let page_ids = doc.get_pages().into_values().collect();
        Self {
            doc,
            page_ids,
            origin: PathBuf::new(),
        }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    pub fn page_id(&self, index: usize) -> Result<ObjectId> {
        self.page_ids.get(index).copied().ok_or_else(|| {
            GradingError::Pdf(format!(
                "page {} out of range ({} pages in {:?})",
                index,
                self.page_ids.len(),
                self.origin
            ))
        })
    }

    /// A new single-page document holding a copy of page `index`.
    pub fn extract_page(&self, index: usize) -> Result<Document> {
        let page_id = self.page_id(index)?;
        assemble(&[&self.doc], &[(0, page_id)])
    }

    /// Raster of page `index`: its largest embedded image, turned upright
    /// according to the page's `/Rotate`.
    pub fn page_image(&self, index: usize) -> Result<DynamicImage> {
        page_image(&self.doc, self.page_id(index)?)
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Build a new document from pages of `sources`, in the order given.
///
/// Each entry of `order` is `(source index, page id in that source)`.
/// Inherited page attributes are flattened onto the copied pages, so a page
/// looks the same in the new document as it did in its source.
pub fn assemble(sources: &[&Document], order: &[(usize, ObjectId)]) -> Result<Document> {
    let mut target = Document::with_version("1.5");
    let pages_id = target.new_object_id();
    let mut importers: Vec<Importer> = sources.iter().map(|s| Importer::new(s)).collect();

    let mut kids = Vec::with_capacity(order.len());
    for &(source, page_id) in order {
        let importer = importers.get_mut(source).ok_or_else(|| {
            GradingError::Pdf(format!("no source document at index {}", source))
        })?;
        let new_id = importer.import_page(&mut target, page_id, pages_id)?;
        kids.push(Object::Reference(new_id));
    }

    let count = kids.len() as i64;
    target.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = target.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    target.trailer.set("Root", catalog_id);

    debug!("Assembled document with {} pages", count);
    Ok(target)
}

/// Copies objects reachable from a page of one source into a target document.
///
/// Shared objects (fonts, images) are copied once per source. References to
/// other nodes of the source page tree are dropped.
struct Importer<'a> {
    source: &'a Document,
    mapped: HashMap<ObjectId, ObjectId>,
}

impl<'a> Importer<'a> {
    fn new(source: &'a Document) -> Self {
        Self {
            source,
            mapped: HashMap::new(),
        }
    }

    fn import_page(
        &mut self,
        target: &mut Document,
        page_id: ObjectId,
        parent: ObjectId,
    ) -> Result<ObjectId> {
        let mut page = self.source.get_dictionary(page_id)?.clone();
        for key in INHERITABLE {
            if !page.has(key) {
                if let Some(value) = inherited(self.source, page_id, key)? {
                    page.set(key.to_vec(), value.clone());
                }
            }
        }
        page.remove(b"Parent");

        let mut copied = self.copy_dict(target, &page, 0)?;
        copied.set("Parent", parent);
        Ok(target.add_object(copied))
    }

    fn copy_object(&mut self, target: &mut Document, obj: &Object, depth: usize) -> Result<Object> {
        if depth > MAX_TREE_DEPTH {
            return Err(GradingError::Pdf("object graph nested too deeply".to_string()));
        }
        Ok(match obj {
            Object::Reference(id) => self.copy_reference(target, *id, depth)?,
            Object::Array(items) => Object::Array(
                items
                    .iter()
                    .map(|o| self.copy_object(target, o, depth + 1))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Object::Dictionary(dict) => {
                Object::Dictionary(self.copy_dict(target, dict, depth + 1)?)
            }
            Object::Stream(stream) => {
                let mut copy = stream.clone();
                copy.dict = self.copy_dict(target, &stream.dict, depth + 1)?;
                Object::Stream(copy)
            }
            other => other.clone(),
        })
    }

    fn copy_dict(
        &mut self,
        target: &mut Document,
        dict: &Dictionary,
        depth: usize,
    ) -> Result<Dictionary> {
        let mut out = Dictionary::new();
        for (key, value) in dict.iter() {
            out.set(key.clone(), self.copy_object(target, value, depth)?);
        }
        Ok(out)
    }

    fn copy_reference(
        &mut self,
        target: &mut Document,
        id: ObjectId,
        depth: usize,
    ) -> Result<Object> {
        if let Some(&new_id) = self.mapped.get(&id) {
            return Ok(Object::Reference(new_id));
        }
        let Ok(source_obj) = self.source.get_object(id) else {
            return Ok(Object::Null);
        };
        if is_page_tree_node(source_obj) {
            return Ok(Object::Null);
        }

        // Reserve the id first so cycles resolve to the same object
        let new_id = target.new_object_id();
        self.mapped.insert(id, new_id);
        let copied = self.copy_object(target, source_obj, depth + 1)?;
        target.objects.insert(new_id, copied);
        Ok(Object::Reference(new_id))
    }
}

fn is_page_tree_node(obj: &Object) -> bool {
    let Ok(dict) = obj.as_dict() else {
        return false;
    };
    matches!(
        dict.get(b"Type").and_then(|t| t.as_name()),
        Ok(b"Page") | Ok(b"Pages")
    )
}

/// Look up a page attribute, walking up `/Parent` links.
fn inherited<'a>(doc: &'a Document, page_id: ObjectId, key: &[u8]) -> Result<Option<&'a Object>> {
    let mut current = page_id;
    for _ in 0..MAX_TREE_DEPTH {
        let dict = doc.get_dictionary(current)?;
        if let Ok(value) = dict.get(key) {
            return Ok(Some(value));
        }
        match dict.get(b"Parent").and_then(|p| p.as_reference()) {
            Ok(parent) => current = parent,
            Err(_) => return Ok(None),
        }
    }
    Err(GradingError::Pdf(format!("page tree above {:?} is too deep", page_id)))
}

/// Follow references until a direct object is reached.
fn resolve<'a>(doc: &'a Document, mut obj: &'a Object) -> Result<&'a Object> {
    for _ in 0..MAX_TREE_DEPTH {
        match obj {
            Object::Reference(id) => obj = doc.get_object(*id)?,
            direct => return Ok(direct),
        }
    }
    Err(GradingError::Pdf("reference chain too long".to_string()))
}

fn resolved_dict(doc: &Document, obj: Option<&Object>) -> Result<Dictionary> {
    match obj {
        Some(o) => Ok(resolve(doc, o)?.as_dict()?.clone()),
        None => Ok(Dictionary::new()),
    }
}

// ============================================================================
// Page editing
// ============================================================================

/// A one-page document `width` x `height` points drawing `content`, with
/// standard Type1 fonts registered as `(resource name, base font)`.
pub fn single_page_document(
    width: f64,
    height: f64,
    content: Vec<u8>,
    fonts: &[(&str, &str)],
) -> Document {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let mut font_dict = Dictionary::new();
    for (name, base_font) in fonts {
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => *base_font,
        });
        font_dict.set(*name, font_id);
    }
    let content_id = doc.add_object(Stream::new(Dictionary::new(), content));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![
            Object::Integer(0),
            Object::Integer(0),
            pdf_number(width),
            pdf_number(height),
        ],
        "Contents" => content_id,
        "Resources" => dictionary! { "Font" => font_dict },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc
}

/// Id of the first page of `doc`.
pub fn first_page_id(doc: &Document) -> Result<ObjectId> {
    doc.get_pages()
        .into_values()
        .next()
        .ok_or_else(|| GradingError::Pdf("document has no pages".to_string()))
}

/// Turn a page clockwise by `degrees` (a multiple of 90).
pub fn rotate_page(doc: &mut Document, page_id: ObjectId, degrees: i32) -> Result<()> {
    let rotation = (page_rotation(doc, page_id)? + degrees as i64).rem_euclid(360);
    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Rotate", rotation);
    Ok(())
}

/// Surround the existing content of a page with two new content streams.
pub fn wrap_page_content(
    doc: &mut Document,
    page_id: ObjectId,
    before: Vec<u8>,
    after: Vec<u8>,
) -> Result<()> {
    let existing: Vec<Object> = match doc.get_dictionary(page_id)?.get(b"Contents") {
        Ok(Object::Array(items)) => items.clone(),
        Ok(Object::Reference(id)) => vec![Object::Reference(*id)],
        _ => Vec::new(),
    };
    let before_id = doc.add_object(Stream::new(Dictionary::new(), before));
    let after_id = doc.add_object(Stream::new(Dictionary::new(), after));

    let mut contents = Vec::with_capacity(existing.len() + 2);
    contents.push(Object::Reference(before_id));
    contents.extend(existing);
    contents.push(Object::Reference(after_id));

    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Contents", contents);
    Ok(())
}

/// Register a standard Type1 font under `name` in the page resources.
pub fn add_page_font(
    doc: &mut Document,
    page_id: ObjectId,
    name: &str,
    base_font: &str,
) -> Result<()> {
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => base_font,
    });
    let page = doc.get_dictionary(page_id)?;
    let mut resources = resolved_dict(doc, page.get(b"Resources").ok())?;
    let mut fonts = resolved_dict(doc, resources.get(b"Font").ok())?;
    fonts.set(name, font_id);
    resources.set("Font", fonts);

    doc.get_object_mut(page_id)?
        .as_dict_mut()?
        .set("Resources", resources);
    Ok(())
}

/// Draw `content` on top of a page, in the coordinates of the page as it is
/// displayed: `(0, 0)` is the bottom-left corner after `/Rotate`. Returns
/// the displayed `(width, height)`.
pub fn overlay_page(doc: &mut Document, page_id: ObjectId, content: &[u8]) -> Result<(f64, f64)> {
    let [x0, y0, x1, y1] = page_box(doc, page_id)?;
    let (w, h) = (x1 - x0, y1 - y0);
    let ([a, b, c, d, e, f], size) = match page_rotation(doc, page_id)? {
        90 => ([0.0, 1.0, -1.0, 0.0, w, 0.0], (h, w)),
        180 => ([-1.0, 0.0, 0.0, -1.0, w, h], (w, h)),
        270 => ([0.0, -1.0, 1.0, 0.0, 0.0, h], (h, w)),
        _ => ([1.0, 0.0, 0.0, 1.0, 0.0, 0.0], (w, h)),
    };

    let mut after = ContentBuilder::new();
    after
        .op(&[], "Q")
        .op(&[], "q")
        .op(&[a, b, c, d, e + x0, f + y0], "cm");
    let mut after = after.into_bytes();
    after.extend_from_slice(content);
    after.extend_from_slice(b"Q\n");
    wrap_page_content(doc, page_id, b"q\n".to_vec(), after)?;
    Ok(size)
}

/// `(width, height)` of a page as it is displayed, after `/Rotate`.
pub fn displayed_size(doc: &Document, page_id: ObjectId) -> Result<(f64, f64)> {
    let [x0, y0, x1, y1] = page_box(doc, page_id)?;
    Ok(match page_rotation(doc, page_id)? {
        90 | 270 => (y1 - y0, x1 - x0),
        _ => (x1 - x0, y1 - y0),
    })
}

/// Annotation subtypes that never carry a grader's mark.
const UNMARKED_ANNOTATIONS: [&[u8]; 3] = [b"Link", b"Popup", b"Widget"];

/// Rectangles of the markup annotations on a page as `[x0, y0, x1, y1]`,
/// normalised so that `x0 <= x1` and `y0 <= y1`.
pub fn annotation_rects(doc: &Document, page_id: ObjectId) -> Result<Vec<[f64; 4]>> {
    let annots = match doc.get_dictionary(page_id)?.get(b"Annots") {
        Ok(obj) => resolve(doc, obj)?.as_array()?,
        Err(_) => return Ok(Vec::new()),
    };

    let mut rects = Vec::with_capacity(annots.len());
    for annot in annots {
        let Some(dict) = resolve(doc, annot).ok().and_then(|a| a.as_dict().ok()) else {
            continue;
        };
        let subtype = dict.get(b"Subtype").and_then(Object::as_name).unwrap_or(b"");
        if UNMARKED_ANNOTATIONS.contains(&subtype) {
            continue;
        }
        let values = dict
            .get(b"Rect")
            .ok()
            .and_then(|r| resolve(doc, r).ok())
            .and_then(|r| r.as_array().ok())
            .and_then(|items| items.iter().map(number).collect::<Option<Vec<f64>>>());
        match values.as_deref() {
            Some(&[ax, ay, bx, by]) => {
                rects.push([ax.min(bx), ay.min(by), ax.max(bx), ay.max(by)])
            }
            _ => debug!("Skipping annotation without a usable Rect"),
        }
    }
    Ok(rects)
}

/// The (possibly inherited) `/MediaBox` as `[x0, y0, x1, y1]`.
pub fn page_box(doc: &Document, page_id: ObjectId) -> Result<[f64; 4]> {
    let media_box = inherited(doc, page_id, b"MediaBox")?
        .ok_or_else(|| GradingError::Pdf("page has no MediaBox".to_string()))?;
    let values = resolve(doc, media_box)?
        .as_array()?
        .iter()
        .map(number)
        .collect::<Option<Vec<f64>>>()
        .filter(|v| v.len() == 4)
        .ok_or_else(|| GradingError::Pdf("malformed MediaBox".to_string()))?;
    Ok([values[0], values[1], values[2], values[3]])
}

/// Clockwise display rotation of a page, normalised to `0..360`.
pub fn page_rotation(doc: &Document, page_id: ObjectId) -> Result<i64> {
    Ok(inherited(doc, page_id, b"Rotate")?
        .and_then(|r| r.as_i64().ok())
        .unwrap_or(0)
        .rem_euclid(360))
}

/// A PDF number object: an integer when `value` is whole.
pub fn pdf_number(value: f64) -> Object {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Object::Integer(value as i64)
    } else {
        Object::Real(value as _)
    }
}

fn number(obj: &Object) -> Option<f64> {
    match obj {
        Object::Integer(i) => Some(*i as f64),
        Object::Real(r) => Some(*r as f64),
        _ => None,
    }
}

/// Accumulates a content stream as text operators.
#[derive(Debug, Default)]
pub struct ContentBuilder {
    buf: String,
}

impl ContentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `operands operator`.
    pub fn op(&mut self, operands: &[f64], operator: &str) -> &mut Self {
        for value in operands {
            self.buf.push_str(&format_number(*value));
            self.buf.push(' ');
        }
        self.buf.push_str(operator);
        self.buf.push('\n');
        self
    }

    /// Show `text` with its baseline starting at `(x, y)`.
    pub fn text(&mut self, font: &str, size: f64, x: f64, y: f64, text: &str) -> &mut Self {
        self.buf.push_str("BT\n");
        self.buf.push_str(&format!("/{} {} Tf\n", font, format_number(size)));
        self.op(&[x, y], "Td");
        self.buf.push_str(&format!("({}) Tj\nET\n", escape_text(text)));
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_bytes()
    }
}

fn format_number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => "0".to_string(),
        t => t.to_string(),
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '(' | ')' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Output
// ============================================================================

pub fn to_bytes(doc: &mut Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    doc.save_to(&mut buf)?;
    Ok(buf)
}

/// Serialize `doc` and atomically replace `path` with it.
pub fn save_document(doc: &mut Document, path: &Path) -> Result<()> {
    let bytes = to_bytes(doc)?;
    write_atomic(path, &bytes)?;
    debug!("Wrote {:?}", path);
    Ok(())
}

// ============================================================================
// Rasters
// ============================================================================

fn page_image(doc: &Document, page_id: ObjectId) -> Result<DynamicImage> {
    let resources = match inherited(doc, page_id, b"Resources")? {
        Some(r) => resolve(doc, r)?.as_dict()?,
        None => return Err(GradingError::Pdf("page has no resources".to_string())),
    };
    let xobjects = match resources.get(b"XObject") {
        Ok(x) => resolve(doc, x)?.as_dict()?,
        Err(_) => return Err(GradingError::Pdf("page has no raster image".to_string())),
    };

    let mut largest: Option<(&Stream, i64)> = None;
    for (_, entry) in xobjects.iter() {
        let Ok(Object::Stream(stream)) = resolve(doc, entry) else {
            continue;
        };
        if !matches!(stream.dict.get(b"Subtype").and_then(|s| s.as_name()), Ok(b"Image")) {
            continue;
        }
        let area = dict_int(&stream.dict, b"Width")? * dict_int(&stream.dict, b"Height")?;
        if largest.map_or(true, |(_, best)| area > best) {
            largest = Some((stream, area));
        }
    }
    let (stream, _) =
        largest.ok_or_else(|| GradingError::Pdf("page has no raster image".to_string()))?;

    let image = decode_image(doc, stream)?;
    Ok(match page_rotation(doc, page_id)? {
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        _ => image,
    })
}

fn dict_int(dict: &Dictionary, key: &[u8]) -> Result<i64> {
    dict.get(key)
        .and_then(|v| v.as_i64())
        .map_err(|_| GradingError::Pdf(format!("image lacks /{}", String::from_utf8_lossy(key))))
}

fn filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|o| o.as_name().ok().map(|n| n.to_vec()))
            .collect(),
        _ => Vec::new(),
    }
}

fn decode_image(doc: &Document, stream: &Stream) -> Result<DynamicImage> {
    let dict = &stream.dict;
    let filters = filters(dict);
    if filters.iter().any(|f| f == b"DCTDecode") {
        return Ok(image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg)?);
    }
    if let Some(position) = filters.iter().position(|f| f == b"CCITTFaxDecode") {
        let params = decode_params(doc, dict, position);
        return decode_ccitt(&stream.content, params, dict);
    }
    if let Some(f) = filters
        .iter()
        .find(|f| !matches!(f.as_slice(), b"FlateDecode" | b"LZWDecode"))
    {
        return Err(GradingError::Pdf(format!(
            "unsupported image filter {}",
            String::from_utf8_lossy(f)
        )));
    }

    let data = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.decompressed_content()?
    };
    let width = dict_int(dict, b"Width")? as u32;
    let height = dict_int(dict, b"Height")? as u32;
    let bits = dict.get(b"BitsPerComponent").and_then(|b| b.as_i64()).unwrap_or(8);
    let pixels = width as usize * height as usize;
    let malformed = || GradingError::Pdf(format!("image data does not match {}x{}", width, height));

    match bits {
        1 => {
            // Bit 0 paints black, for plain bilevel images and stencil masks alike
            let stride = (width as usize).div_ceil(8);
            if data.len() < stride * height as usize {
                return Err(malformed());
            }
            let white = if inverted_decode(dict) { 0 } else { 1 };
            let gray = GrayImage::from_fn(width, height, |x, y| {
                let byte = data[y as usize * stride + x as usize / 8];
                let bit = (byte >> (7 - x % 8)) & 1;
                image::Luma([if bit == white { 255 } else { 0 }])
            });
            Ok(DynamicImage::ImageLuma8(gray))
        }
        8 => match data.len().checked_div(pixels).unwrap_or(0) {
            1 => {
                let gray = GrayImage::from_raw(width, height, data[..pixels].to_vec())
                    .ok_or_else(malformed)?;
                Ok(DynamicImage::ImageLuma8(gray))
            }
            3 => {
                let rgb = RgbImage::from_raw(width, height, data[..pixels * 3].to_vec())
                    .ok_or_else(malformed)?;
                Ok(DynamicImage::ImageRgb8(rgb))
            }
            4 => {
                let rgb = RgbImage::from_fn(width, height, |x, y| {
                    let i = (y as usize * width as usize + x as usize) * 4;
                    let k = 255 - data[i + 3] as u32;
                    let channel = |c: u8| ((255 - c as u32) * k / 255) as u8;
                    image::Rgb([channel(data[i]), channel(data[i + 1]), channel(data[i + 2])])
                });
                Ok(DynamicImage::ImageRgb8(rgb))
            }
            _ => Err(malformed()),
        },
        other => Err(GradingError::Pdf(format!("unsupported bit depth {}", other))),
    }
}

/// `/DecodeParms` of the filter at `position` in the filter chain.
fn decode_params<'a>(
    doc: &'a Document,
    dict: &'a Dictionary,
    position: usize,
) -> Option<&'a Dictionary> {
    let params = resolve(doc, dict.get(b"DecodeParms").ok()?).ok()?;
    let params = match params {
        Object::Array(items) => resolve(doc, items.get(position)?).ok()?,
        other => other,
    };
    params.as_dict().ok()
}

/// A `/Decode [1 0]` array swaps the meaning of the sample values.
fn inverted_decode(dict: &Dictionary) -> bool {
    match dict.get(b"Decode").and_then(|d| d.as_array()) {
        Ok(values) => values.first().and_then(number).is_some_and(|first| first > 0.5),
        Err(_) => false,
    }
}

/// Bilevel fax-coded scans: Group 4 when `/K` is negative, otherwise
/// one-dimensional Group 3. Mixed Group 3 (`/K` > 0) is not decoded.
fn decode_ccitt(
    data: &[u8],
    params: Option<&Dictionary>,
    dict: &Dictionary,
) -> Result<DynamicImage> {
    let param = |key: &[u8]| {
        params
            .and_then(|p| p.get(key).ok())
            .and_then(|v| v.as_i64().ok())
    };
    let width = dict_int(dict, b"Width")?;
    let height = dict_int(dict, b"Height")?;
    let k = param(b"K").unwrap_or(0);
    let columns = param(b"Columns").unwrap_or(width);
    let too_large = || GradingError::Pdf(format!("fax image {}x{} is too large", columns, height));
    let columns = u16::try_from(columns).map_err(|_| too_large())?;
    let rows = u16::try_from(height).map_err(|_| too_large())?;
    let (width, height) = (width as u32, height as u32);
    if k > 0 {
        return Err(GradingError::Pdf("unsupported image filter CCITTFaxDecode K>0".to_string()));
    }

    let (black, white) = if inverted_decode(dict) { (255, 0) } else { (0, 255) };
    let mut pixels: Vec<u8> = Vec::with_capacity(width as usize * height as usize);
    let mut lines = 0u32;
    let push_line = |transitions: &[u16]| {
        if lines < height {
            pixels.extend(
                pels(transitions, columns)
                    .chain(std::iter::repeat(Color::White))
                    .take(width as usize)
                    .map(|c| if c == Color::Black { black } else { white }),
            );
            lines += 1;
        }
    };
    let complete = if k < 0 {
        decode_g4(data.iter().copied(), columns, Some(rows), push_line)
    } else {
        decode_g3(data.iter().copied(), push_line)
    };
    if lines == 0 {
        return Err(GradingError::Pdf("fax image data could not be decoded".to_string()));
    }
    if complete.is_none() || lines < height {
        debug!("Fax image stopped after {} of {} rows", lines, height);
    }
    pixels.resize(width as usize * height as usize, white);
    let gray = GrayImage::from_raw(width, height, pixels).ok_or_else(|| {
        GradingError::Pdf(format!("image data does not match {}x{}", width, height))
    })?;
    Ok(DynamicImage::ImageLuma8(gray))
}

/// Small documents for tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use lopdf::content::{Content, Operation};

    /// One letter-size page per label, each showing its label as text.
    /// Resources live on the page tree root so pages inherit them.
    pub fn label_document(labels: &[&str]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });

        let mut kids = Vec::new();
        for label in labels {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 700.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*label)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = doc.add_object(Stream::new(
                Dictionary::new(),
                content.encode().expect("encode content"),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
                "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    /// One page per image, each drawn full-page from an uncompressed gray XObject.
    pub fn image_document(images: &[GrayImage]) -> Document {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut kids = Vec::new();
        for image in images {
            let (w, h) = image.dimensions();
            let image_id = doc.add_object(Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => w as i64,
                    "Height" => h as i64,
                    "ColorSpace" => "DeviceGray",
                    "BitsPerComponent" => 8,
                },
                image.as_raw().clone(),
            ));
            let draw = format!("q {} 0 0 {} 0 0 cm /Im0 Do Q", w, h).into_bytes();
            let content_id = doc.add_object(Stream::new(Dictionary::new(), draw));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "MediaBox" => vec![0.into(), 0.into(), (w as i64).into(), (h as i64).into()],
                "Contents" => content_id,
                "Resources" => dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
            });
            kids.push(Object::Reference(page_id));
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc
    }

    /// A single page whose image is a Group 4 fax encoding of `image`,
    /// thresholded at mid-gray.
    pub fn fax_document(image: &GrayImage) -> Document {
        let (w, h) = image.dimensions();
        let mut encoder = fax::encoder::Encoder::new(fax::VecWriter::new());
        for row in image.rows() {
            let pels = row.map(|p| if p.0[0] < 128 { Color::Black } else { Color::White });
            encoder.encode_line(pels, w as u16).expect("encode line");
        }
        let data = encoder.finish().expect("finish encoding").finish();

        let mut doc = image_document(&[GrayImage::new(1, 1)]);
        let page_id = *doc.get_pages().values().next().expect("one page");
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w as i64,
                "Height" => h as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 1,
                "Filter" => "CCITTFaxDecode",
                "DecodeParms" => dictionary! {
                    "K" => -1,
                    "Columns" => w as i64,
                    "Rows" => h as i64,
                },
            },
            data,
        ));
        let page = doc
            .get_object_mut(page_id)
            .and_then(|o| o.as_dict_mut())
            .expect("page dictionary");
        page.set(
            "Resources",
            dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
        );
        doc
    }

    /// Page count of a document on disk.
    pub fn count_pages(path: &Path) -> usize {
        PdfBundle::open(path).expect("open document").page_count()
    }

    /// Concatenated content bytes of every page, in page order.
    pub fn page_contents(doc: &Document) -> Vec<Vec<u8>> {
        doc.get_pages()
            .into_values()
            .map(|id| doc.get_page_content(id).expect("page content"))
            .collect()
    }

    /// The text label shown on each page of a [`label_document`].
    pub fn page_labels(doc: &Document) -> Vec<String> {
        page_contents(doc)
            .iter()
            .map(|bytes| {
                let text = String::from_utf8_lossy(bytes);
                let start = text.find('(').map(|i| i + 1).unwrap_or(0);
                let end = text[start..].find(')').map(|i| start + i).unwrap_or(start);
                text[start..end].to_string()
            })
            .collect()
    }
}
