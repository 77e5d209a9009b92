//! Path-addressable element tree used by the hierarchical manifest parser.
//!
//! Queries look like `Period[0].AdaptationSet[1].Representation[2].id`:
//! every step but the last selects the n-th child element with that local
//! name (index defaults to 0); the last step names an attribute, or a child
//! element whose text is returned. Absent values come back as `""`.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use crate::error::{Result, SluiceError};

/// Index of a node inside a [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug, Default)]
struct Node {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<usize>,
}

#[derive(Debug)]
pub struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let body = super::strip_bom(raw);
        let xml = std::str::from_utf8(body)
            .map_err(|e| SluiceError::manifest(format!("manifest is not UTF-8: {e}")))?;

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut nodes: Vec<Node> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| SluiceError::manifest(format!("malformed XML: {e}")))?;
            match event {
                Event::Start(ref e) => {
                    let id = push_node(&mut nodes, &stack, e)?;
                    stack.push(id);
                }
                Event::Empty(ref e) => {
                    push_node(&mut nodes, &stack, e)?;
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(ref e) => {
                    if let Some(&current) = stack.last() {
                        let text = e
                            .unescape()
                            .map_err(|e| SluiceError::manifest(format!("bad text node: {e}")))?;
                        nodes[current].text.push_str(&text);
                    }
                }
                Event::CData(ref e) => {
                    if let Some(&current) = stack.last() {
                        nodes[current]
                            .text
                            .push_str(&String::from_utf8_lossy(&e[..]));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if nodes.is_empty() {
            return Err(SluiceError::manifest("manifest has no root element"));
        }
        Ok(Self { nodes })
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.0].name
    }

    pub fn text(&self, node: NodeId) -> &str {
        self.nodes[node.0].text.trim()
    }

    pub fn attribute(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes[node.0]
            .attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The `index`-th child element of `node` named `name`.
    pub fn child(&self, node: NodeId, name: &str, index: usize) -> Option<NodeId> {
        self.nodes[node.0]
            .children
            .iter()
            .copied()
            .filter(|&c| self.nodes[c].name == name)
            .nth(index)
            .map(NodeId)
    }

    /// Resolve an element-only path relative to `scope`.
    pub fn select(&self, path: &str, scope: NodeId) -> Option<NodeId> {
        let mut node = scope;
        for step in path.split('.').filter(|s| !s.is_empty()) {
            let (name, index) = parse_step(step)?;
            node = self.child(node, name, index)?;
        }
        Some(node)
    }

    /// Resolve `path` relative to `scope` and return its value, or `""` when
    /// any step is missing.
    pub fn find(&self, path: &str, scope: NodeId) -> &str {
        let (parents, last) = match path.rsplit_once('.') {
            Some((parents, last)) => (parents, last),
            None => ("", path),
        };
        let Some(node) = self.select(parents, scope) else {
            return "";
        };
        let Some((name, index)) = parse_step(last) else {
            return "";
        };

        if !last.contains('[')
            && let Some(value) = self.attribute(node, name)
        {
            return value;
        }
        self.child(node, name, index)
            .map(|child| self.text(child))
            .unwrap_or("")
    }
}

fn push_node(nodes: &mut Vec<Node>, stack: &[usize], start: &BytesStart<'_>) -> Result<usize> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SluiceError::manifest(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| SluiceError::manifest(format!("bad attribute value: {e}")))?
            .into_owned();
        attributes.push((key, value));
    }

    let id = nodes.len();
    nodes.push(Node {
        name,
        attributes,
        ..Node::default()
    });
    match stack.last() {
        Some(&parent) => nodes[parent].children.push(id),
        None if id != 0 => {
            return Err(SluiceError::manifest("manifest has more than one root element"));
        }
        None => {}
    }
    Ok(id)
}

/// `Name` or `Name[3]`
fn parse_step(step: &str) -> Option<(&str, usize)> {
    match step.split_once('[') {
        Some((name, rest)) => {
            let index = rest.strip_suffix(']')?.trim().parse().ok()?;
            Some((name, index))
        }
        None => Some((step, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <BaseURL>http://cdn/base/</BaseURL>
  <Period id="p0">
    <AdaptationSet contentType="video">
      <Representation id="v0" bandwidth="500000"/>
      <Representation id="v1" bandwidth="1500000"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" lang="en">
      <Representation id="a0" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn finds_attributes_by_path() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let root = tree.root();
        assert_eq!(tree.name(root), "MPD");
        assert_eq!(tree.find("type", root), "static");
        assert_eq!(tree.find("Period[0].AdaptationSet[0].Representation[1].id", root), "v1");
        assert_eq!(tree.find("Period.AdaptationSet[1].lang", root), "en");
        assert_eq!(tree.find("BaseURL", root), "http://cdn/base/");
    }

    #[test]
    fn missing_paths_are_empty() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let root = tree.root();
        assert_eq!(tree.find("Period[1].id", root), "");
        assert_eq!(tree.find("Period[0].AdaptationSet[0].Representation[5].id", root), "");
        assert_eq!(tree.find("Period[0].nope", root), "");
        assert_eq!(tree.find("Period[x].id", root), "");
    }

    #[test]
    fn scoped_queries() {
        let tree = Tree::parse(DOC.as_bytes()).unwrap();
        let set = tree.select("Period[0].AdaptationSet[1]", tree.root()).unwrap();
        assert_eq!(tree.find("Representation[0].bandwidth", set), "128000");
        assert_eq!(tree.find("contentType", set), "audio");
    }

    #[test]
    fn rejects_non_xml() {
        assert!(Tree::parse(b"").is_err());
        assert!(Tree::parse(b"<MPD><Period></MPD>").is_err());
    }
}
