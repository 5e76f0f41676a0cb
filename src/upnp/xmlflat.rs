//! A minimal generic XML tree, used only where the schema is not known at
//! compile time: SOAP action arguments/responses (the argument set comes
//! from a runtime-parsed SCPD) and GENA event bodies (the variable set is
//! per-service). Fixed-schema documents (DIDL-Lite, device/SCPD
//! descriptions) use `instant_xml` derives instead, per the teacher's idiom.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub tag: String,
    pub attrs: HashMap<String, String>,
    pub children: Vec<Node>,
    pub text: String,
}

impl Node {
    /// local name, stripping any `ns:` prefix.
    pub fn local_name(&self) -> &str {
        self.tag.rsplit(':').next().unwrap_or(&self.tag)
    }

    pub fn child(&self, local_name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    pub fn find_recursive(&self, local_name: &str) -> Option<&Node> {
        if self.local_name() == local_name {
            return Some(self);
        }
        for c in &self.children {
            if let Some(found) = c.find_recursive(local_name) {
                return Some(found);
            }
        }
        None
    }

    /// Maps each direct child's local name to its text content.
    pub fn children_as_map(&self) -> HashMap<String, String> {
        self.children
            .iter()
            .map(|c| (c.local_name().to_string(), c.text.clone()))
            .collect()
    }
}

/// Parses an XML document into a single root `Node` tree (text decoded,
/// attributes collected, namespace declarations left as ordinary
/// attributes since callers only care about local names here).
pub fn parse(xml: &str) -> crate::Result<Node> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Node> = vec![Node {
        tag: "#document".to_string(),
        ..Default::default()
    }];

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.decode_and_unescape_value(reader.decoder())
                        .unwrap_or_default()
                        .to_string();
                    attrs.insert(key, value);
                }
                stack.push(Node {
                    tag,
                    attrs,
                    children: Vec::new(),
                    text: String::new(),
                });
            }
            Ok(Event::Empty(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let mut attrs = HashMap::new();
                for attr in e.attributes().flatten() {
                    let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
                    let value = attr.decode_and_unescape_value(reader.decoder())
                        .unwrap_or_default()
                        .to_string();
                    attrs.insert(key, value);
                }
                let node = Node {
                    tag,
                    attrs,
                    children: Vec::new(),
                    text: String::new(),
                };
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().unwrap_or_default().to_string();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(t.as_ref()).to_string();
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&text);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() > 1 {
                    let finished = stack.pop().expect("stack non-empty");
                    stack.last_mut().expect("root remains").children.push(finished);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(crate::Error::InvalidResponse(format!(
                    "XML parse error: {err}"
                )))
            }
        }
    }

    let mut root = stack.pop().ok_or_else(|| {
        crate::Error::InvalidResponse("empty XML document".to_string())
    })?;
    root.children
        .pop()
        .ok_or_else(|| crate::Error::InvalidResponse("no root element".to_string()))
        .map(|r| {
            // preserve any top-level text collected on the synthetic #document node
            let _ = &mut root;
            r
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_nested_with_attrs() {
        let xml = r#"<a:Envelope xmlns:a="urn:x"><a:Body><Volume val="42"/><Name>hi &amp; bye</Name></a:Body></a:Envelope>"#;
        let root = parse(xml).unwrap();
        assert_eq!(root.local_name(), "Envelope");
        let body = root.child("Body").unwrap();
        let volume = body.child("Volume").unwrap();
        assert_eq!(volume.attrs.get("val").unwrap(), "42");
        let name = body.child("Name").unwrap();
        assert_eq!(name.text, "hi & bye");
    }

    #[test]
    fn find_recursive_digs_through_levels() {
        let xml = r#"<e:propertyset xmlns:e="urn:x"><e:property><LastChange>x</LastChange></e:property></e:propertyset>"#;
        let root = parse(xml).unwrap();
        let last_change = root.find_recursive("LastChange").unwrap();
        assert_eq!(last_change.text, "x");
    }
}
