use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use zip::ZipArchive;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const ZIP_MAGIC: &[u8] = b"PK";

/// How many leading bytes are inspected when deciding whether a raw blob
/// is XML.
const RAW_SNIFF_WINDOW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Gzip,
    Zip,
    Raw,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Gzip => "gz",
            Kind::Zip => "zip",
            Kind::Raw => "raw",
        }
    }
}

/// Detect the container type by magic bytes. The filename is never
/// consulted; retailers routinely mislabel extensions.
pub fn sniff_kind(data: &[u8]) -> Kind {
    if data.starts_with(GZIP_MAGIC) {
        Kind::Gzip
    } else if data.starts_with(ZIP_MAGIC) {
        Kind::Zip
    } else {
        Kind::Raw
    }
}

fn strip_container_ext(hint: &str) -> String {
    let mut name = hint.to_string();
    for ext in [".gz", ".zip"] {
        if name.to_lowercase().ends_with(ext) {
            name.truncate(name.len() - ext.len());
        }
    }
    if name.is_empty() {
        "data.xml".to_string()
    } else {
        name
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn looks_like_xml(data: &[u8]) -> bool {
    let window = &data[..data.len().min(RAW_SNIFF_WINDOW)];
    window.contains(&b'<') && window.contains(&b'>')
}

/// Lazy sequence of `(inner_name, xml_bytes)` pairs contained in a blob.
///
/// Zip members are decompressed one at a time so peak memory stays at a
/// single inner document.
pub enum XmlEntries<'a> {
    Empty,
    Single(Option<(String, Vec<u8>)>),
    Zip {
        archive: ZipArchive<Cursor<&'a [u8]>>,
        index: usize,
    },
}

impl Iterator for XmlEntries<'_> {
    type Item = (String, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            XmlEntries::Empty => None,
            XmlEntries::Single(entry) => entry.take(),
            XmlEntries::Zip { archive, index } => {
                while *index < archive.len() {
                    let i = *index;
                    *index += 1;
                    let mut file = match archive.by_index(i) {
                        Ok(file) => file,
                        Err(err) => {
                            log::warn!("zip entry {i} unreadable: {err}");
                            continue;
                        }
                    };
                    if !file.name().to_lowercase().ends_with(".xml") {
                        continue;
                    }
                    let name = file.name().to_string();
                    let mut bytes = Vec::new();
                    match file.read_to_end(&mut bytes) {
                        Ok(_) => return Some((name, bytes)),
                        Err(err) => {
                            log::warn!("zip entry {name} corrupt: {err}");
                            continue;
                        }
                    }
                }
                None
            }
        }
    }
}

fn open_zip(data: &[u8]) -> Option<XmlEntries<'_>> {
    match ZipArchive::new(Cursor::new(data)) {
        Ok(archive) => Some(XmlEntries::Zip { archive, index: 0 }),
        Err(_) => None,
    }
}

/// Extract every XML document from a raw / gzip / zip blob.
///
/// The container is chosen by magic bytes, with the advertised filename
/// used only to name gzip and raw entries. A blob that fails to open as
/// the sniffed container is retried as the other one before giving up,
/// which recovers zips shipped as `.gz` and vice versa.
pub fn iter_xml_entries<'a>(data: &'a [u8], filename_hint: &str) -> XmlEntries<'a> {
    match sniff_kind(data) {
        Kind::Gzip => match gunzip(data) {
            Ok(xml) => XmlEntries::Single(Some((strip_container_ext(filename_hint), xml))),
            Err(err) => {
                log::warn!("gzip decode failed for {filename_hint}, retrying as zip: {err}");
                match open_zip(data) {
                    Some(entries) => entries,
                    None => raw_entry(data, filename_hint),
                }
            }
        },
        Kind::Zip => match open_zip(data) {
            Some(entries) => entries,
            None => match gunzip(data) {
                Ok(xml) => {
                    log::warn!("zip open failed for {filename_hint}, recovered as gzip");
                    XmlEntries::Single(Some((strip_container_ext(filename_hint), xml)))
                }
                Err(_) => raw_entry(data, filename_hint),
            },
        },
        Kind::Raw => raw_entry(data, filename_hint),
    }
}

fn raw_entry<'a>(data: &[u8], filename_hint: &str) -> XmlEntries<'a> {
    if looks_like_xml(data) {
        let name = if filename_hint.is_empty() {
            "data.xml".to_string()
        } else {
            filename_hint.to_string()
        };
        XmlEntries::Single(Some((name, data.to_vec())))
    } else {
        XmlEntries::Empty
    }
}
