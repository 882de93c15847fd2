//! Minimal reader for EC2 Query API responses.
//!
//! EC2 answers with small, attribute-free XML documents. Tags are located with
//! a regex and folded into an element tree; anything fancier (CDATA, comments,
//! processing instructions other than the prolog) is not expected.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("invalid tag pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("closing tag </{found}> does not match <{expected}>")]
    Mismatched { expected: String, found: String },

    #[error("unexpected closing tag </{0}>")]
    UnexpectedClose(String),

    #[error("element <{0}> is never closed")]
    Unclosed(String),

    #[error("document has no root element")]
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    text: String,
    pub children: Vec<Element>,
}

impl Element {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Character data directly inside this element, entity-decoded and trimmed.
    pub fn value(&self) -> String {
        unescape(self.text.trim())
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Value of the direct child `name`, if present.
    pub fn text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::value)
    }

    /// Follow a path of direct children, e.g. `["instanceState", "name"]`.
    pub fn path(&self, names: &[&str]) -> Option<&Element> {
        names.iter().try_fold(self, |el, name| el.child(name))
    }

    /// `<item>` entries of the list element `list`; empty when the list is absent.
    pub fn items<'a>(&'a self, list: &str) -> impl Iterator<Item = &'a Element> + use<'a> {
        self.child(list)
            .into_iter()
            .flat_map(|l| l.children.iter())
            .filter(|c| c.name == "item")
    }
}

pub fn parse(document: &str) -> Result<Element, XmlError> {
    let tag = Regex::new(r"<(/?)([A-Za-z_][\w.:-]*)[^>]*?(/?)>")?;

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut last = 0;

    for caps in tag.captures_iter(document) {
        let whole = caps.get(0).ok_or(XmlError::Empty)?;
        if let Some(open) = stack.last_mut() {
            open.text.push_str(&document[last..whole.start()]);
        }
        last = whole.end();

        let closing = !caps[1].is_empty();
        let self_closing = !caps[3].is_empty();
        let name = &caps[2];

        if closing {
            let done = stack
                .pop()
                .ok_or_else(|| XmlError::UnexpectedClose(name.to_string()))?;
            if done.name != name {
                return Err(XmlError::Mismatched {
                    expected: done.name,
                    found: name.to_string(),
                });
            }
            attach(&mut stack, &mut root, done);
        } else if self_closing {
            attach(&mut stack, &mut root, Element::new(name));
        } else {
            stack.push(Element::new(name));
        }
    }

    if let Some(open) = stack.pop() {
        return Err(XmlError::Unclosed(open.name));
    }
    root.ok_or(XmlError::Empty)
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Decode predefined and numeric character references in one pass.
/// Unknown or malformed references are kept as written.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail
            .find(';')
            .and_then(|end| entity(&tail[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
