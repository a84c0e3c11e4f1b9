/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! XML canonicalization.
//!
//! Produces the byte-exact form that digests and signatures are computed
//! over. The rules follow exclusive canonicalization without comments:
//!
//! - the XML declaration, comments, processing instructions and doctype are
//!   dropped
//! - whitespace-only text nodes are dropped
//! - empty elements are written as start/end pairs
//! - a namespace declaration is written only on the first emitted element
//!   that uses its prefix and whose output ancestors do not already bind it
//!   to the same URI; declarations sort by prefix, attributes by name
//! - text and attribute values are re-escaped, CDATA becomes escaped text
//!
//! The output is idempotent: canonicalizing canonical output returns it
//! unchanged.

use std::collections::BTreeSet;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Namespace of XML digital signatures.
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";

/// Reasons a document cannot be canonicalized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CanonicalError {
    #[error("Document is empty")]
    Empty,

    #[error("Document has no root element")]
    NoRoot,

    #[error("Document has more than one root element")]
    MultipleRoots,

    #[error("Unbalanced tags: {0}")]
    Unbalanced(String),

    #[error("Text outside the root element")]
    TextOutsideRoot,

    #[error("Unbound namespace prefix '{0}'")]
    UnboundPrefix(String),

    #[error("Malformed XML: {0}")]
    Malformed(String),
}

/// Canonical form of a whole document.
pub fn canonicalize(xml: &str) -> Result<String, CanonicalError> {
    Canonicalizer::new(Selection::Document {
        skip_enveloped: false,
    })
    .run(xml)?
    .ok_or(CanonicalError::NoRoot)
}

/// Canonical form of a document with any `ds:Signature` children of the root
/// removed (the enveloped-signature transform).
pub fn canonicalize_enveloped(xml: &str) -> Result<String, CanonicalError> {
    Canonicalizer::new(Selection::Document {
        skip_enveloped: true,
    })
    .run(xml)?
    .ok_or(CanonicalError::NoRoot)
}

/// Canonical form of the first element named `local_name` in `namespace`,
/// or `None` if the document has no such element.
pub fn canonicalize_element(
    xml: &str,
    namespace: &str,
    local_name: &str,
) -> Result<Option<String>, CanonicalError> {
    Canonicalizer::new(Selection::Element {
        namespace,
        local_name,
        in_signature: false,
    })
    .run(xml)
}

/// Canonical form of the first element named `local_name` in `namespace`
/// inside the document's signature: the first `ds:Signature` that is the
/// root or a child of the root. Elements of the same name elsewhere in the
/// document are ignored.
pub fn canonicalize_signature_part(
    xml: &str,
    namespace: &str,
    local_name: &str,
) -> Result<Option<String>, CanonicalError> {
    Canonicalizer::new(Selection::Element {
        namespace,
        local_name,
        in_signature: true,
    })
    .run(xml)
}

/// Deepest position of a signature the verifier accepts: the root of a
/// detached envelope (1) or a child of the signed document's root (2).
pub const SIGNATURE_MAX_DEPTH: usize = 2;

/// Escapes character data.
pub fn escape_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

/// Escapes an attribute value.
pub fn escape_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}

fn is_xml_whitespace(s: &str) -> bool {
    s.chars().all(|c| matches!(c, ' ' | '\t' | '\r' | '\n'))
}

fn split_qname(name: &str) -> (&str, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", name),
    }
}

enum Selection<'a> {
    Document { skip_enveloped: bool },
    Element {
        namespace: &'a str,
        local_name: &'a str,
        in_signature: bool,
    },
}

struct Canonicalizer<'a> {
    selection: Selection<'a>,
    out: String,
    text: String,
    /// Declarations made by each open source element.
    in_scope: Vec<Vec<(String, String)>>,
    /// Declarations written on each open emitted element.
    rendered: Vec<Vec<(String, String)>>,
    names: Vec<String>,
    roots: usize,
    /// Source depth of the element that started emission.
    emit_from: Option<usize>,
    /// Source depth of the subtree being skipped.
    skip_from: Option<usize>,
    /// Source depth of the open document signature.
    signature_at: Option<usize>,
    signature_closed: bool,
    finished: bool,
}

impl<'a> Canonicalizer<'a> {
    fn new(selection: Selection<'a>) -> Self {
        Self {
            selection,
            out: String::new(),
            text: String::new(),
            in_scope: Vec::new(),
            rendered: Vec::new(),
            names: Vec::new(),
            roots: 0,
            emit_from: None,
            skip_from: None,
            signature_at: None,
            signature_closed: false,
            finished: false,
        }
    }

    fn run(mut self, xml: &str) -> Result<Option<String>, CanonicalError> {
        if xml.trim().is_empty() {
            return Err(CanonicalError::Empty);
        }
        let normalized = xml.replace("\r\n", "\n").replace('\r', "\n");
        let mut reader = Reader::from_str(&normalized);

        loop {
            let event = reader
                .read_event()
                .map_err(|e| CanonicalError::Malformed(e.to_string()))?;
            match event {
                Event::Start(e) => self.start(&e)?,
                Event::Empty(e) => {
                    self.start(&e)?;
                    self.end()?;
                }
                Event::End(_) => self.end()?,
                Event::Text(t) => {
                    let value = t
                        .unescape()
                        .map_err(|e| CanonicalError::Malformed(e.to_string()))?;
                    self.characters(&value)?;
                }
                Event::CData(c) => {
                    let value = std::str::from_utf8(&c)
                        .map_err(|e| CanonicalError::Malformed(e.to_string()))?;
                    self.characters(value)?;
                }
                Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => break,
            }
            if self.finished {
                return Ok(Some(self.out));
            }
        }

        if !self.names.is_empty() {
            return Err(CanonicalError::Unbalanced(format!(
                "<{}> is never closed",
                self.names.join("><")
            )));
        }
        if self.roots == 0 {
            return Err(CanonicalError::NoRoot);
        }
        match self.selection {
            Selection::Document { .. } => Ok(Some(self.out)),
            Selection::Element { .. } => Ok(None),
        }
    }

    fn emitting(&self) -> bool {
        self.emit_from.is_some() && self.skip_from.is_none()
    }

    fn lookup<'s>(scopes: &'s [Vec<(String, String)>], prefix: &str) -> Option<&'s str> {
        scopes
            .iter()
            .rev()
            .flat_map(|decls| decls.iter())
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn characters(&mut self, value: &str) -> Result<(), CanonicalError> {
        if self.names.is_empty() {
            if !is_xml_whitespace(value) {
                return Err(CanonicalError::TextOutsideRoot);
            }
            return Ok(());
        }
        if self.emitting() {
            self.text.push_str(value);
        }
        Ok(())
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            if !is_xml_whitespace(&self.text) {
                escape_text(&self.text, &mut self.out);
            }
            self.text.clear();
        }
    }

    fn start(&mut self, e: &BytesStart<'_>) -> Result<(), CanonicalError> {
        let name = std::str::from_utf8(e.name().as_ref())
            .map_err(|e| CanonicalError::Malformed(e.to_string()))?
            .to_string();

        let mut decls = Vec::new();
        let mut attrs = Vec::new();
        for attr in e.attributes() {
            let attr = attr.map_err(|e| CanonicalError::Malformed(e.to_string()))?;
            let key = std::str::from_utf8(attr.key.as_ref())
                .map_err(|e| CanonicalError::Malformed(e.to_string()))?
                .to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| CanonicalError::Malformed(e.to_string()))?
                .into_owned();
            if key == "xmlns" {
                decls.push((String::new(), value));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                decls.push((prefix.to_string(), value));
            } else {
                attrs.push((key, value));
            }
        }

        if self.names.is_empty() {
            self.roots += 1;
            if self.roots > 1 {
                return Err(CanonicalError::MultipleRoots);
            }
        }

        self.flush_text();
        self.in_scope.push(decls);
        self.names.push(name.clone());
        let depth = self.names.len();

        if self.skip_from.is_some() {
            return Ok(());
        }

        let (prefix, local) = split_qname(&name);
        let uri = Self::lookup(&self.in_scope, prefix).unwrap_or("");
        let is_signature = local == "Signature" && uri == DSIG_NS;
        if is_signature
            && depth <= SIGNATURE_MAX_DEPTH
            && self.signature_at.is_none()
            && !self.signature_closed
        {
            self.signature_at = Some(depth);
        }

        match self.selection {
            Selection::Document { skip_enveloped } => {
                if skip_enveloped && depth == 2 && is_signature {
                    self.skip_from = Some(depth);
                    return Ok(());
                }
                if depth == 1 {
                    self.emit_from = Some(1);
                }
            }
            Selection::Element {
                namespace,
                local_name,
                in_signature,
            } => {
                let placed = !in_signature || self.signature_at.is_some_and(|at| depth > at);
                if self.emit_from.is_none() && placed && local == local_name && uri == namespace {
                    self.emit_from = Some(depth);
                }
            }
        }

        if self.emitting() {
            self.render_start(&name, attrs)?;
        }
        Ok(())
    }

    fn render_start(
        &mut self,
        name: &str,
        mut attrs: Vec<(String, String)>,
    ) -> Result<(), CanonicalError> {
        let mut used = BTreeSet::new();
        used.insert(split_qname(name).0.to_string());
        for (key, _) in &attrs {
            if let Some((prefix, _)) = key.split_once(':') {
                used.insert(prefix.to_string());
            }
        }

        let mut written = Vec::new();
        for prefix in used {
            if prefix == "xml" {
                continue;
            }
            let in_scope = match Self::lookup(&self.in_scope, &prefix) {
                Some(uri) => uri,
                None if prefix.is_empty() => "",
                None => return Err(CanonicalError::UnboundPrefix(prefix)),
            };
            let rendered = Self::lookup(&self.rendered, &prefix).unwrap_or("");
            if in_scope != rendered {
                written.push((prefix.clone(), in_scope.to_string()));
            }
        }

        attrs.sort_by(|a, b| a.0.cmp(&b.0));

        self.out.push('<');
        self.out.push_str(name);
        for (prefix, uri) in &written {
            if prefix.is_empty() {
                self.out.push_str(" xmlns=\"");
            } else {
                self.out.push_str(" xmlns:");
                self.out.push_str(prefix);
                self.out.push_str("=\"");
            }
            escape_attr(uri, &mut self.out);
            self.out.push('"');
        }
        for (key, value) in &attrs {
            self.out.push(' ');
            self.out.push_str(key);
            self.out.push_str("=\"");
            escape_attr(value, &mut self.out);
            self.out.push('"');
        }
        self.out.push('>');

        self.rendered.push(written);
        Ok(())
    }

    fn end(&mut self) -> Result<(), CanonicalError> {
        let depth = self.names.len();
        let name = self
            .names
            .pop()
            .ok_or_else(|| CanonicalError::Unbalanced("closing tag without opening tag".into()))?;
        if self.signature_at == Some(depth) {
            self.signature_at = None;
            self.signature_closed = true;
        }

        if let Some(skip) = self.skip_from {
            if skip == depth {
                self.skip_from = None;
            }
            self.in_scope.pop();
            return Ok(());
        }

        if self.emitting() {
            self.flush_text();
            self.out.push_str("</");
            self.out.push_str(&name);
            self.out.push('>');
            self.rendered.pop();

            if self.emit_from == Some(depth) {
                self.emit_from = None;
                if matches!(self.selection, Selection::Element { .. }) {
                    self.finished = true;
                }
            }
        }
        self.in_scope.pop();
        Ok(())
    }
}
