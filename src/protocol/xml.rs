//! XML control messages.
//!
//! Control traffic is a closed vocabulary of small XML documents. Metadata
//! replies reuse the request's root element; only the cull replies carry
//! distinct `*_reply` roots. Every root has a `version` attribute checked
//! against a compile-time constant, and file names are base64-encoded so
//! arbitrary bytes tunnel through the XML layer.
//!
//! Both directions are implemented here: the client renders requests and
//! parses replies, the server end (exercised by the test harness) does the
//! reverse.

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};

use super::ProtocolError;

pub const MD_OPEN_READ_VERSION: &str = "V1";
pub const MD_OPEN_CREATE_VERSION: &str = "V1";
pub const MD_CLOSE_VERSION: &str = "V1";
pub const MD_LIST_VERSION: &str = "V1";
pub const MD_DELETE_VERSION: &str = "V1";
pub const CULL_SETUP_VERSION: &str = "V1";
pub const CULL_SHAS_VERSION: &str = "V1";
pub const CULL_COMPLETE_VERSION: &str = "V1";

/// A remote file as reported by `ct_md_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedFile {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
}

/// Client-to-server control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlMsg {
    MdOpenRead { name: String, chunkno: Option<u32> },
    MdOpenCreate { name: String, chunkno: Option<u32> },
    MdClose,
    MdList,
    MdDelete { name: String },
    CullSetup { uuid: u64 },
    CullShas { uuid: u64, shas: Vec<[u8; 20]> },
    CullComplete { uuid: u64 },
}

/// Server-to-client control reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtrlReply {
    /// Reply to either open request. `None` means the open failed
    /// (no such remote file).
    Opened { name: Option<String> },
    Closed,
    List { files: Vec<ListedFile> },
    /// `None` means the archive to delete did not exist.
    Deleted { name: Option<String> },
    CullSetupOk,
    CullShasOk,
    CullCompleteOk,
}

fn werr<E: std::fmt::Display>(err: E) -> ProtocolError {
    ProtocolError::BadControl(err.to_string())
}

fn open_doc(root: &'static str, version: &'static str) -> (Writer<Vec<u8>>, &'static str) {
    let mut writer = Writer::new(Vec::new());
    let mut el = BytesStart::new(root);
    el.push_attribute(("version", version));
    // the caller writes children and the matching end tag
    writer
        .write_event(Event::Start(el))
        .expect("xml write to Vec cannot fail");
    (writer, root)
}

fn close_doc(mut writer: Writer<Vec<u8>>, root: &str) -> Vec<u8> {
    writer
        .write_event(Event::End(BytesEnd::new(root)))
        .expect("xml write to Vec cannot fail");
    writer.into_inner()
}

fn empty_doc(root: &str, version: &str) -> Vec<u8> {
    let mut writer = Writer::new(Vec::new());
    let mut el = BytesStart::new(root);
    el.push_attribute(("version", version));
    writer
        .write_event(Event::Empty(el))
        .expect("xml write to Vec cannot fail");
    writer.into_inner()
}

fn file_element(name: &str, chunkno: Option<u32>) -> BytesStart<'static> {
    let mut el = BytesStart::new("file");
    el.push_attribute(("name", base64::encode(name.as_bytes()).as_str()));
    if let Some(chunkno) = chunkno {
        el.push_attribute(("chunkno", chunkno.to_string().as_str()));
    }
    el
}

fn open_like(root: &'static str, version: &'static str, name: &str, chunkno: Option<u32>) -> Vec<u8> {
    let (mut writer, root) = open_doc(root, version);
    writer
        .write_event(Event::Empty(file_element(name, chunkno)))
        .expect("xml write to Vec cannot fail");
    close_doc(writer, root)
}

impl CtrlMsg {
    /// Render the request document.
    pub fn render(&self) -> Vec<u8> {
        match self {
            CtrlMsg::MdOpenRead { name, chunkno } => {
                open_like("ct_md_open_read", MD_OPEN_READ_VERSION, name, *chunkno)
            }
            CtrlMsg::MdOpenCreate { name, chunkno } => {
                open_like("ct_md_open_create", MD_OPEN_CREATE_VERSION, name, *chunkno)
            }
            CtrlMsg::MdClose => empty_doc("ct_md_close", MD_CLOSE_VERSION),
            CtrlMsg::MdList => empty_doc("ct_md_list", MD_LIST_VERSION),
            CtrlMsg::MdDelete { name } => {
                open_like("ct_md_delete", MD_DELETE_VERSION, name, None)
            }
            CtrlMsg::CullSetup { uuid } => {
                let (mut writer, root) = open_doc("ct_cull_setup", CULL_SETUP_VERSION);
                let mut el = BytesStart::new("cull");
                el.push_attribute(("type", "precious"));
                el.push_attribute(("uuid", uuid.to_string().as_str()));
                writer
                    .write_event(Event::Empty(el))
                    .expect("xml write to Vec cannot fail");
                close_doc(writer, root)
            }
            CtrlMsg::CullShas { uuid, shas } => {
                let (mut writer, root) = open_doc("ct_cull_shas", CULL_SHAS_VERSION);
                let mut el = BytesStart::new("uuid");
                el.push_attribute(("value", uuid.to_string().as_str()));
                writer
                    .write_event(Event::Empty(el))
                    .expect("xml write to Vec cannot fail");
                for sha in shas {
                    let mut el = BytesStart::new("sha");
                    el.push_attribute(("sha", hex::encode(sha).as_str()));
                    writer
                        .write_event(Event::Empty(el))
                        .expect("xml write to Vec cannot fail");
                }
                close_doc(writer, root)
            }
            CtrlMsg::CullComplete { uuid } => {
                let (mut writer, root) = open_doc("ct_cull_complete", CULL_COMPLETE_VERSION);
                let mut el = BytesStart::new("cull");
                el.push_attribute(("type", "process"));
                el.push_attribute(("uuid", uuid.to_string().as_str()));
                writer
                    .write_event(Event::Empty(el))
                    .expect("xml write to Vec cannot fail");
                close_doc(writer, root)
            }
        }
    }

    /// Parse a request document (the server end of the dialog).
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let doc = Document::parse(body)?;
        match doc.root.as_str() {
            "ct_md_open_read" => {
                doc.check_version(MD_OPEN_READ_VERSION)?;
                let (name, chunkno) = doc.file_with_chunkno()?;
                Ok(CtrlMsg::MdOpenRead { name, chunkno })
            }
            "ct_md_open_create" => {
                doc.check_version(MD_OPEN_CREATE_VERSION)?;
                let (name, chunkno) = doc.file_with_chunkno()?;
                Ok(CtrlMsg::MdOpenCreate { name, chunkno })
            }
            "ct_md_close" => {
                doc.check_version(MD_CLOSE_VERSION)?;
                Ok(CtrlMsg::MdClose)
            }
            "ct_md_list" => {
                doc.check_version(MD_LIST_VERSION)?;
                Ok(CtrlMsg::MdList)
            }
            "ct_md_delete" => {
                doc.check_version(MD_DELETE_VERSION)?;
                let (name, _) = doc.file_with_chunkno()?;
                Ok(CtrlMsg::MdDelete { name })
            }
            "ct_cull_setup" => {
                doc.check_version(CULL_SETUP_VERSION)?;
                Ok(CtrlMsg::CullSetup {
                    uuid: doc.cull_uuid()?,
                })
            }
            "ct_cull_shas" => {
                doc.check_version(CULL_SHAS_VERSION)?;
                let uuid = doc
                    .find_attr("uuid", "value")?
                    .ok_or_else(|| ProtocolError::BadControl("missing uuid".into()))?
                    .parse()
                    .map_err(werr)?;
                let mut shas = Vec::new();
                for el in doc.children_named("sha") {
                    let hexstr = el
                        .attr("sha")
                        .ok_or_else(|| ProtocolError::BadControl("sha without value".into()))?;
                    let raw = hex::decode(hexstr).map_err(werr)?;
                    if raw.len() != 20 {
                        return Err(ProtocolError::BadControl("sha of wrong length".into()));
                    }
                    let mut sha = [0u8; 20];
                    sha.copy_from_slice(&raw);
                    shas.push(sha);
                }
                Ok(CtrlMsg::CullShas { uuid, shas })
            }
            "ct_cull_complete" => {
                doc.check_version(CULL_COMPLETE_VERSION)?;
                Ok(CtrlMsg::CullComplete {
                    uuid: doc.cull_uuid()?,
                })
            }
            other => Err(ProtocolError::UnknownControl(other.to_string())),
        }
    }
}

impl CtrlReply {
    /// Render the reply document (the server end of the dialog).
    pub fn render(&self) -> Vec<u8> {
        match self {
            CtrlReply::Opened { name } => {
                let (mut writer, root) = open_doc("ct_md_open_read", MD_OPEN_READ_VERSION);
                let mut el = BytesStart::new("file");
                let encoded = match name {
                    Some(name) => base64::encode(name.as_bytes()),
                    None => String::new(),
                };
                el.push_attribute(("name", encoded.as_str()));
                writer
                    .write_event(Event::Empty(el))
                    .expect("xml write to Vec cannot fail");
                close_doc(writer, root)
            }
            CtrlReply::Closed => empty_doc("ct_md_close", MD_CLOSE_VERSION),
            CtrlReply::List { files } => {
                let (mut writer, root) = open_doc("ct_md_list", MD_LIST_VERSION);
                for file in files {
                    let mut el = BytesStart::new("file");
                    el.push_attribute(("name", base64::encode(file.name.as_bytes()).as_str()));
                    el.push_attribute(("size", file.size.to_string().as_str()));
                    el.push_attribute(("mtime", file.mtime.to_string().as_str()));
                    writer
                        .write_event(Event::Empty(el))
                        .expect("xml write to Vec cannot fail");
                }
                close_doc(writer, root)
            }
            CtrlReply::Deleted { name } => {
                let (mut writer, root) = open_doc("ct_md_delete", MD_DELETE_VERSION);
                let mut el = BytesStart::new("file");
                let encoded = match name {
                    Some(name) => base64::encode(name.as_bytes()),
                    None => String::new(),
                };
                el.push_attribute(("name", encoded.as_str()));
                writer
                    .write_event(Event::Empty(el))
                    .expect("xml write to Vec cannot fail");
                close_doc(writer, root)
            }
            CtrlReply::CullSetupOk => empty_doc("ct_cull_setup_reply", CULL_SETUP_VERSION),
            CtrlReply::CullShasOk => empty_doc("ct_cull_shas_reply", CULL_SHAS_VERSION),
            CtrlReply::CullCompleteOk => {
                empty_doc("ct_cull_complete_reply", CULL_COMPLETE_VERSION)
            }
        }
    }

    /// Parse a reply document.
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let doc = Document::parse(body)?;
        match doc.root.as_str() {
            // both open replies share the shape, servers echo either root
            "ct_md_open_read" | "ct_md_open_create" => {
                doc.check_version(MD_OPEN_READ_VERSION)?;
                Ok(CtrlReply::Opened {
                    name: doc.optional_file_name()?,
                })
            }
            "ct_md_close" => {
                doc.check_version(MD_CLOSE_VERSION)?;
                Ok(CtrlReply::Closed)
            }
            "ct_md_list" => {
                doc.check_version(MD_LIST_VERSION)?;
                let mut files = Vec::new();
                for el in doc.children_named("file") {
                    let name = match el.attr("name") {
                        Some(encoded) if !encoded.is_empty() => decode_name(encoded)?,
                        _ => continue,
                    };
                    let size = el
                        .attr("size")
                        .ok_or_else(|| ProtocolError::BadControl("file without size".into()))?
                        .parse()
                        .map_err(werr)?;
                    let mtime = el
                        .attr("mtime")
                        .ok_or_else(|| ProtocolError::BadControl("file without mtime".into()))?
                        .parse()
                        .map_err(werr)?;
                    files.push(ListedFile { name, size, mtime });
                }
                Ok(CtrlReply::List { files })
            }
            "ct_md_delete" => {
                doc.check_version(MD_DELETE_VERSION)?;
                Ok(CtrlReply::Deleted {
                    name: doc.optional_file_name()?,
                })
            }
            "ct_cull_setup_reply" => {
                doc.check_version(CULL_SETUP_VERSION)?;
                Ok(CtrlReply::CullSetupOk)
            }
            "ct_cull_shas_reply" => {
                doc.check_version(CULL_SHAS_VERSION)?;
                Ok(CtrlReply::CullShasOk)
            }
            "ct_cull_complete_reply" => {
                doc.check_version(CULL_COMPLETE_VERSION)?;
                Ok(CtrlReply::CullCompleteOk)
            }
            other => Err(ProtocolError::UnknownControl(other.to_string())),
        }
    }
}

fn decode_name(encoded: &str) -> Result<String, ProtocolError> {
    let raw = base64::decode(encoded).map_err(werr)?;
    String::from_utf8(raw).map_err(werr)
}

/// Flat view of a parsed control document: the root element plus its
/// children with their attributes. The vocabulary has no deeper nesting.
struct Document {
    root: String,
    version: Option<String>,
    children: Vec<Element>,
}

struct Element {
    name: String,
    attrs: Vec<(String, String)>,
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl Document {
    fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(body).map_err(werr)?;
        let mut reader = Reader::from_str(text);
        reader.trim_text(true);

        let mut root: Option<(String, Option<String>)> = None;
        let mut children = Vec::new();

        loop {
            match reader.read_event().map_err(werr)? {
                Event::Decl(_) | Event::Text(_) | Event::Comment(_) => {}
                Event::Start(el) | Event::Empty(el) => {
                    let name = String::from_utf8(el.name().as_ref().to_vec()).map_err(werr)?;
                    let mut attrs = Vec::new();
                    for attr in el.attributes() {
                        let attr = attr.map_err(werr)?;
                        let key =
                            String::from_utf8(attr.key.as_ref().to_vec()).map_err(werr)?;
                        let value = attr.unescape_value().map_err(werr)?.into_owned();
                        attrs.push((key, value));
                    }
                    if root.is_none() {
                        let version = attrs
                            .iter()
                            .find(|(k, _)| k == "version")
                            .map(|(_, v)| v.clone());
                        root = Some((name, version));
                    } else {
                        children.push(Element { name, attrs });
                    }
                }
                Event::End(_) => {}
                Event::Eof => break,
                _ => {}
            }
        }

        let (root, version) =
            root.ok_or_else(|| ProtocolError::BadControl("empty document".into()))?;
        Ok(Document {
            root,
            version,
            children,
        })
    }

    fn check_version(&self, expected: &str) -> Result<(), ProtocolError> {
        if self.version.as_deref() != Some(expected) {
            return Err(ProtocolError::ControlVersionMismatch {
                element: self.root.clone(),
                got: self.version.clone(),
            });
        }
        Ok(())
    }

    fn children_named<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a Element> + 'b
    where
        'a: 'b,
    {
        self.children.iter().filter(move |el| el.name == name)
    }

    fn find_attr<'a>(&'a self, element: &str, key: &str) -> Result<Option<&'a str>, ProtocolError> {
        Ok(self.children_named(element).next().and_then(|el| el.attr(key)))
    }

    fn optional_file_name(&self) -> Result<Option<String>, ProtocolError> {
        match self.find_attr("file", "name")? {
            Some(encoded) if !encoded.is_empty() => Ok(Some(decode_name(encoded)?)),
            _ => Ok(None),
        }
    }

    fn file_with_chunkno(&self) -> Result<(String, Option<u32>), ProtocolError> {
        let el = self
            .children_named("file")
            .next()
            .ok_or_else(|| ProtocolError::BadControl("missing file element".into()))?;
        let name = match el.attr("name") {
            Some(encoded) if !encoded.is_empty() => decode_name(encoded)?,
            _ => return Err(ProtocolError::BadControl("file without name".into())),
        };
        let chunkno = match el.attr("chunkno") {
            Some(value) => Some(value.parse().map_err(werr)?),
            None => None,
        };
        Ok((name, chunkno))
    }

    fn cull_uuid(&self) -> Result<u64, ProtocolError> {
        self.find_attr("cull", "uuid")?
            .ok_or_else(|| ProtocolError::BadControl("missing cull uuid".into()))?
            .parse()
            .map_err(werr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_create_round_trip() {
        let msg = CtrlMsg::MdOpenCreate {
            name: "20240102-030405-photos".to_string(),
            chunkno: None,
        };
        let body = msg.render();
        assert_eq!(CtrlMsg::parse(&body).unwrap(), msg);

        // base64 keeps awkward bytes out of the markup
        let text = std::str::from_utf8(&body).unwrap();
        assert!(!text.contains("photos"));
    }

    #[test]
    fn open_with_chunkno() {
        let msg = CtrlMsg::MdOpenCreate {
            name: "tag".to_string(),
            chunkno: Some(17),
        };
        let body = msg.render();
        assert_eq!(CtrlMsg::parse(&body).unwrap(), msg);
    }

    #[test]
    fn cull_dialog_round_trips() {
        for msg in [
            CtrlMsg::CullSetup { uuid: u64::MAX },
            CtrlMsg::CullShas {
                uuid: 42,
                shas: vec![[0xab; 20], [0x01; 20]],
            },
            CtrlMsg::CullComplete { uuid: 42 },
        ] {
            let body = msg.render();
            assert_eq!(CtrlMsg::parse(&body).unwrap(), msg);
        }
    }

    #[test]
    fn list_reply_round_trip() {
        let reply = CtrlReply::List {
            files: vec![
                ListedFile {
                    name: "20240102-030405-photos".to_string(),
                    size: 12345,
                    mtime: 1704164645,
                },
                ListedFile {
                    name: "00000000000000002000-crypto.secrets".to_string(),
                    size: 512,
                    mtime: 2000,
                },
            ],
        };
        let body = reply.render();
        assert_eq!(CtrlReply::parse(&body).unwrap(), reply);
    }

    #[test]
    fn failed_open_has_empty_name() {
        let body = CtrlReply::Opened { name: None }.render();
        match CtrlReply::parse(&body).unwrap() {
            CtrlReply::Opened { name: None } => {}
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let body = b"<ct_md_close version=\"V9\"/>";
        match CtrlReply::parse(body) {
            Err(ProtocolError::ControlVersionMismatch { element, got }) => {
                assert_eq!(element, "ct_md_close");
                assert_eq!(got.as_deref(), Some("V9"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn unknown_root_is_rejected() {
        let body = b"<ct_md_frobnicate version=\"V1\"/>";
        assert!(matches!(
            CtrlReply::parse(body),
            Err(ProtocolError::UnknownControl(_))
        ));
        assert!(matches!(
            CtrlMsg::parse(body),
            Err(ProtocolError::UnknownControl(_))
        ));
    }
}
