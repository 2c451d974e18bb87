//! Minimal DICOM Part-10 codec.
//!
//! Supports what the pipeline needs and nothing more:
//!
//! - Parsing little-endian files (explicit or implicit VR), keeping nested
//!   sequences and encapsulated pixel data as opaque raw bytes
//! - Removing top-level direct identifiers and re-encoding the object
//! - Building a Secondary Capture object around a non-DICOM source image
//!
//! # File Layout
//!
//! ```text
//! [128-byte preamble]["DICM"][group 0002 meta, explicit VR LE][dataset]
//! ```

use std::collections::BTreeMap;

use thiserror::Error;
use uuid::Uuid;

use crate::batch::ContentKind;

/// Explicit VR little endian transfer syntax.
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
/// Implicit VR little endian transfer syntax.
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
/// Explicit VR big endian transfer syntax (retired, unsupported).
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
/// Secondary Capture Image Storage SOP class.
pub const SECONDARY_CAPTURE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.7";

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
const IMPLEMENTATION_CLASS_UID: &str = "2.25.302914405522391838716011212891290215377";

/// Errors that can occur while reading or writing DICOM objects.
#[derive(Debug, Error)]
pub enum DicomError {
    #[error("Not a DICOM Part-10 file: missing DICM prefix")]
    NotDicom,

    #[error("Unexpected end of data at offset {0}")]
    Truncated(usize),

    #[error("Malformed element at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("Unsupported transfer syntax: {0}")]
    UnsupportedTransferSyntax(String),

    #[error("Value of {tag} is too long for VR {vr}")]
    ValueTooLong { tag: Tag, vr: String },
}

/// A DICOM attribute tag (group, element).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(pub u16, pub u16);

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:04X},{:04X})", self.0, self.1)
    }
}

/// Well-known tags.
pub mod tags {
    use super::Tag;

    pub const FILE_META_GROUP_LENGTH: Tag = Tag(0x0002, 0x0000);
    pub const FILE_META_VERSION: Tag = Tag(0x0002, 0x0001);
    pub const MEDIA_STORAGE_SOP_CLASS_UID: Tag = Tag(0x0002, 0x0002);
    pub const MEDIA_STORAGE_SOP_INSTANCE_UID: Tag = Tag(0x0002, 0x0003);
    pub const TRANSFER_SYNTAX_UID: Tag = Tag(0x0002, 0x0010);
    pub const IMPLEMENTATION_CLASS_UID: Tag = Tag(0x0002, 0x0012);
    pub const IMAGE_TYPE: Tag = Tag(0x0008, 0x0008);
    pub const SOP_CLASS_UID: Tag = Tag(0x0008, 0x0016);
    pub const SOP_INSTANCE_UID: Tag = Tag(0x0008, 0x0018);
    pub const MODALITY: Tag = Tag(0x0008, 0x0060);
    pub const CONVERSION_TYPE: Tag = Tag(0x0008, 0x0064);
    pub const INSTITUTION_NAME: Tag = Tag(0x0008, 0x0080);
    pub const PATIENT_NAME: Tag = Tag(0x0010, 0x0010);
    pub const PATIENT_ID: Tag = Tag(0x0010, 0x0020);
    pub const PATIENT_BIRTH_DATE: Tag = Tag(0x0010, 0x0030);
    pub const STUDY_INSTANCE_UID: Tag = Tag(0x0020, 0x000D);
    pub const SERIES_INSTANCE_UID: Tag = Tag(0x0020, 0x000E);
    pub const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);
    pub const ITEM: Tag = Tag(0xFFFE, 0xE000);
    pub const ITEM_DELIMITATION: Tag = Tag(0xFFFE, 0xE00D);
    pub const SEQUENCE_DELIMITATION: Tag = Tag(0xFFFE, 0xE0DD);
}

/// Direct identifiers removed during anonymization, with their keywords.
pub const DIRECT_IDENTIFIERS: [(Tag, &str); 4] = [
    (tags::PATIENT_NAME, "PatientName"),
    (tags::PATIENT_ID, "PatientID"),
    (tags::PATIENT_BIRTH_DATE, "PatientBirthDate"),
    (tags::INSTITUTION_NAME, "InstitutionName"),
];

/// A data element value.
///
/// Elements with undefined length keep their raw body, including the
/// closing delimiter, so they can be written back untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Value representation; `None` for implicit VR datasets.
    pub vr: Option<[u8; 2]>,
    pub value: Vec<u8>,
    pub undefined_length: bool,
}

impl Element {
    fn explicit(vr: &[u8; 2], value: Vec<u8>) -> Self {
        Self {
            vr: Some(*vr),
            value,
            undefined_length: false,
        }
    }

    /// Builds a text element, padded to even length as the VR requires.
    pub fn text(vr: &[u8; 2], text: &str) -> Self {
        let mut value = text.as_bytes().to_vec();
        if value.len() % 2 == 1 {
            value.push(if vr == b"UI" { 0 } else { b' ' });
        }
        Self::explicit(vr, value)
    }

    /// Builds a binary element, zero-padded to even length.
    pub fn binary(vr: &[u8; 2], bytes: &[u8]) -> Self {
        let mut value = bytes.to_vec();
        if value.len() % 2 == 1 {
            value.push(0);
        }
        Self::explicit(vr, value)
    }

    /// Returns the value as trimmed text.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.value)
            .trim_end_matches(['\0', ' '])
            .to_string()
    }
}

/// A parsed DICOM Part-10 object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomObject {
    meta: BTreeMap<Tag, Element>,
    dataset: BTreeMap<Tag, Element>,
    explicit_vr: bool,
}

impl DicomObject {
    /// Creates an empty explicit VR little endian object.
    pub fn new() -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(tags::FILE_META_VERSION, Element::binary(b"OB", &[0, 1]));
        meta.insert(
            tags::TRANSFER_SYNTAX_UID,
            Element::text(b"UI", EXPLICIT_VR_LITTLE_ENDIAN),
        );
        meta.insert(
            tags::IMPLEMENTATION_CLASS_UID,
            Element::text(b"UI", IMPLEMENTATION_CLASS_UID),
        );
        Self {
            meta,
            dataset: BTreeMap::new(),
            explicit_vr: true,
        }
    }

    /// Parses a Part-10 byte stream.
    pub fn parse(bytes: &[u8]) -> Result<Self, DicomError> {
        if !has_part10_prefix(bytes) {
            return Err(DicomError::NotDicom);
        }

        let mut reader = Reader::new(bytes, PREAMBLE_LEN + MAGIC.len());

        let mut meta = BTreeMap::new();
        while reader.peek_group()? == Some(0x0002) {
            let (tag, element) = read_element(&mut reader, true)?;
            if tag != tags::FILE_META_GROUP_LENGTH {
                meta.insert(tag, element);
            }
        }

        let transfer_syntax = meta
            .get(&tags::TRANSFER_SYNTAX_UID)
            .map(Element::as_text)
            .unwrap_or_else(|| EXPLICIT_VR_LITTLE_ENDIAN.to_string());
        let explicit_vr = match transfer_syntax.as_str() {
            IMPLICIT_VR_LITTLE_ENDIAN => false,
            EXPLICIT_VR_BIG_ENDIAN => {
                return Err(DicomError::UnsupportedTransferSyntax(transfer_syntax))
            }
            _ => true,
        };

        let mut dataset = BTreeMap::new();
        while !reader.is_empty() {
            let (tag, element) = read_element(&mut reader, explicit_vr)?;
            dataset.insert(tag, element);
        }

        Ok(Self {
            meta,
            dataset,
            explicit_vr,
        })
    }

    /// Returns a dataset element.
    pub fn get(&self, tag: Tag) -> Option<&Element> {
        self.dataset.get(&tag)
    }

    /// Returns a dataset element as text.
    pub fn text(&self, tag: Tag) -> Option<String> {
        self.get(tag).map(Element::as_text)
    }

    /// Returns a file meta element as text.
    pub fn meta_text(&self, tag: Tag) -> Option<String> {
        self.meta.get(&tag).map(Element::as_text)
    }

    /// Inserts or replaces a dataset element.
    pub fn insert(&mut self, tag: Tag, element: Element) {
        self.dataset.insert(tag, element);
    }

    /// Inserts or replaces a file meta element.
    pub fn insert_meta(&mut self, tag: Tag, element: Element) {
        self.meta.insert(tag, element);
    }

    /// Removes a dataset element.
    pub fn remove(&mut self, tag: Tag) -> Option<Element> {
        self.dataset.remove(&tag)
    }

    /// Number of dataset elements.
    pub fn len(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Encodes the object as a Part-10 byte stream.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DicomError> {
        let mut meta_body = Vec::new();
        for (tag, element) in &self.meta {
            write_element(&mut meta_body, *tag, element, true)?;
        }

        let mut out = Vec::with_capacity(PREAMBLE_LEN + MAGIC.len() + meta_body.len() + 12);
        out.extend_from_slice(&[0u8; PREAMBLE_LEN]);
        out.extend_from_slice(MAGIC);
        write_element(
            &mut out,
            tags::FILE_META_GROUP_LENGTH,
            &Element::binary(b"UL", &(meta_body.len() as u32).to_le_bytes()),
            true,
        )?;
        out.extend_from_slice(&meta_body);

        for (tag, element) in &self.dataset {
            write_element(&mut out, *tag, element, self.explicit_vr)?;
        }

        Ok(out)
    }
}

impl Default for DicomObject {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns whether bytes carry the Part-10 preamble and `DICM` prefix.
pub fn has_part10_prefix(bytes: &[u8]) -> bool {
    bytes.len() >= PREAMBLE_LEN + MAGIC.len() && &bytes[PREAMBLE_LEN..PREAMBLE_LEN + 4] == MAGIC
}

/// Result of removing direct identifiers from an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anonymized {
    /// Re-encoded de-identified object.
    pub bytes: Vec<u8>,
    /// Identifiers that were present, keyed by keyword, with their prior values.
    pub removed: BTreeMap<String, String>,
}

/// Removes direct identifiers from an encoded object.
pub trait Anonymizer: Send + Sync {
    fn anonymize(&self, dicom: &[u8]) -> Result<Anonymized, DicomError>;
}

/// Strips the fixed list of [`DIRECT_IDENTIFIERS`] from the top-level dataset.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagStripper;

impl Anonymizer for TagStripper {
    fn anonymize(&self, dicom: &[u8]) -> Result<Anonymized, DicomError> {
        let mut object = DicomObject::parse(dicom)?;
        let removed = strip_identifiers(&mut object);
        Ok(Anonymized {
            bytes: object.to_bytes()?,
            removed,
        })
    }
}

/// Removes identifiers in place and returns what was removed.
pub fn strip_identifiers(object: &mut DicomObject) -> BTreeMap<String, String> {
    let mut removed = BTreeMap::new();
    for (tag, keyword) in DIRECT_IDENTIFIERS {
        if let Some(element) = object.remove(tag) {
            removed.insert(keyword.to_string(), element.as_text());
        }
    }
    removed
}

/// Converts a non-DICOM image into a DICOM object.
pub trait ImageConverter: Send + Sync {
    fn convert(
        &self,
        source: &[u8],
        kind: ContentKind,
        artifact_id: Uuid,
    ) -> Result<Vec<u8>, DicomError>;
}

/// Wraps the source bitstream in a Secondary Capture object.
///
/// Rasterization (grayscale, resizing) belongs to a dedicated converter
/// plugged in through [`ImageConverter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SecondaryCaptureConverter;

impl ImageConverter for SecondaryCaptureConverter {
    fn convert(
        &self,
        source: &[u8],
        _kind: ContentKind,
        artifact_id: Uuid,
    ) -> Result<Vec<u8>, DicomError> {
        let sop_instance_uid = uid_from_uuid(artifact_id);

        let mut object = DicomObject::new();
        object.insert_meta(
            tags::MEDIA_STORAGE_SOP_CLASS_UID,
            Element::text(b"UI", SECONDARY_CAPTURE_SOP_CLASS),
        );
        object.insert_meta(
            tags::MEDIA_STORAGE_SOP_INSTANCE_UID,
            Element::text(b"UI", &sop_instance_uid),
        );

        object.insert(
            tags::IMAGE_TYPE,
            Element::text(b"CS", "DERIVED\\SECONDARY\\PROCESSED"),
        );
        object.insert(
            tags::SOP_CLASS_UID,
            Element::text(b"UI", SECONDARY_CAPTURE_SOP_CLASS),
        );
        object.insert(tags::SOP_INSTANCE_UID, Element::text(b"UI", &sop_instance_uid));
        object.insert(tags::MODALITY, Element::text(b"CS", "OT"));
        object.insert(tags::CONVERSION_TYPE, Element::text(b"CS", "WSD"));
        object.insert(tags::PATIENT_NAME, Element::text(b"PN", "Anonymous"));
        object.insert(tags::PATIENT_ID, Element::text(b"LO", "ANON001"));
        object.insert(
            tags::STUDY_INSTANCE_UID,
            Element::text(b"UI", &uid_from_uuid(Uuid::new_v4())),
        );
        object.insert(
            tags::SERIES_INSTANCE_UID,
            Element::text(b"UI", &uid_from_uuid(Uuid::new_v4())),
        );
        object.insert(tags::PIXEL_DATA, Element::binary(b"OB", source));

        object.to_bytes()
    }
}

/// Builds a `2.25.<decimal>` UID from a UUID.
pub fn uid_from_uuid(id: Uuid) -> String {
    format!("2.25.{}", id.as_u128())
}

// =========================================================================
// Encoding helpers
// =========================================================================

fn is_long_vr(vr: &[u8; 2]) -> bool {
    matches!(
        vr,
        b"OB" | b"OD" | b"OF" | b"OL" | b"OV" | b"OW" | b"SQ" | b"SV" | b"UC" | b"UN" | b"UR"
            | b"UT" | b"UV"
    )
}

fn write_element(
    out: &mut Vec<u8>,
    tag: Tag,
    element: &Element,
    explicit_vr: bool,
) -> Result<(), DicomError> {
    out.extend_from_slice(&tag.0.to_le_bytes());
    out.extend_from_slice(&tag.1.to_le_bytes());

    let length = if element.undefined_length {
        UNDEFINED_LENGTH
    } else {
        element.value.len() as u32
    };

    match (explicit_vr, element.vr) {
        (true, Some(vr)) if is_long_vr(&vr) => {
            out.extend_from_slice(&vr);
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&length.to_le_bytes());
        }
        (true, Some(vr)) => {
            let short = u16::try_from(element.value.len()).map_err(|_| DicomError::ValueTooLong {
                tag,
                vr: String::from_utf8_lossy(&vr).to_string(),
            })?;
            out.extend_from_slice(&vr);
            out.extend_from_slice(&short.to_le_bytes());
        }
        (true, None) => {
            // Implicit element written into an explicit stream.
            out.extend_from_slice(b"UN");
            out.extend_from_slice(&[0, 0]);
            out.extend_from_slice(&length.to_le_bytes());
        }
        (false, _) => out.extend_from_slice(&length.to_le_bytes()),
    }

    out.extend_from_slice(&element.value);
    Ok(())
}

// =========================================================================
// Decoding helpers
// =========================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DicomError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DicomError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DicomError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DicomError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn peek_group(&self) -> Result<Option<u16>, DicomError> {
        if self.is_empty() {
            return Ok(None);
        }
        let b = self
            .buf
            .get(self.pos..self.pos + 2)
            .ok_or(DicomError::Truncated(self.pos))?;
        Ok(Some(u16::from_le_bytes([b[0], b[1]])))
    }
}

struct Header {
    tag: Tag,
    vr: Option<[u8; 2]>,
    length: u32,
}

fn read_header(reader: &mut Reader<'_>, explicit_vr: bool) -> Result<Header, DicomError> {
    let tag = Tag(reader.u16()?, reader.u16()?);

    // Items and delimiters never carry a VR.
    if tag.0 == 0xFFFE {
        return Ok(Header {
            tag,
            vr: None,
            length: reader.u32()?,
        });
    }

    if !explicit_vr {
        return Ok(Header {
            tag,
            vr: None,
            length: reader.u32()?,
        });
    }

    let raw = reader.take(2)?;
    let vr = [raw[0], raw[1]];
    if !vr.iter().all(u8::is_ascii_uppercase) {
        return Err(DicomError::Malformed {
            offset: reader.pos - 2,
            reason: format!("invalid VR bytes {:02X}{:02X} for {}", vr[0], vr[1], tag),
        });
    }

    let length = if is_long_vr(&vr) {
        reader.take(2)?;
        reader.u32()?
    } else {
        reader.u16()? as u32
    };

    Ok(Header {
        tag,
        vr: Some(vr),
        length,
    })
}

fn read_element(reader: &mut Reader<'_>, explicit_vr: bool) -> Result<(Tag, Element), DicomError> {
    let offset = reader.pos;
    let header = read_header(reader, explicit_vr)?;
    if header.tag.0 == 0xFFFE {
        return Err(DicomError::Malformed {
            offset,
            reason: format!("unexpected {} at dataset level", header.tag),
        });
    }

    if header.length == UNDEFINED_LENGTH {
        let start = reader.pos;
        skip_sequence(reader, explicit_vr)?;
        let value = reader.buf[start..reader.pos].to_vec();
        return Ok((
            header.tag,
            Element {
                vr: header.vr,
                value,
                undefined_length: true,
            },
        ));
    }

    let value = reader.take(header.length as usize)?.to_vec();
    Ok((
        header.tag,
        Element {
            vr: header.vr,
            value,
            undefined_length: false,
        },
    ))
}

/// Deepest sequence/item nesting accepted when skipping undefined-length values.
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Nesting {
    Sequence,
    Item,
}

/// Skips an undefined-length sequence body up to and including its delimiter.
///
/// Nested sequences and items are tracked on an explicit stack so the input
/// cannot drive the call depth; anything nested deeper than
/// [`MAX_NESTING_DEPTH`] is malformed.
fn skip_sequence(reader: &mut Reader<'_>, explicit_vr: bool) -> Result<(), DicomError> {
    let mut stack = vec![Nesting::Sequence];

    while let Some(&level) = stack.last() {
        let offset = reader.pos;
        let header = read_header(reader, explicit_vr)?;

        let opens = match level {
            Nesting::Sequence => match header.tag {
                tags::SEQUENCE_DELIMITATION => {
                    stack.pop();
                    continue;
                }
                tags::ITEM if header.length == UNDEFINED_LENGTH => Nesting::Item,
                tags::ITEM => {
                    reader.take(header.length as usize)?;
                    continue;
                }
                other => {
                    return Err(DicomError::Malformed {
                        offset,
                        reason: format!("expected item or delimiter, found {}", other),
                    })
                }
            },
            Nesting::Item => {
                if header.tag == tags::ITEM_DELIMITATION {
                    stack.pop();
                    continue;
                }
                if header.length != UNDEFINED_LENGTH {
                    reader.take(header.length as usize)?;
                    continue;
                }
                Nesting::Sequence
            }
        };

        if stack.len() >= MAX_NESTING_DEPTH {
            return Err(DicomError::Malformed {
                offset,
                reason: format!("nesting deeper than {} levels", MAX_NESTING_DEPTH),
            });
        }
        stack.push(opens);
    }

    Ok(())
}
