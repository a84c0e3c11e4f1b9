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

//! Building and reading `ds:Signature` envelopes.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;

use super::canonical::{escape_attr, escape_text, DSIG_NS, SIGNATURE_MAX_DEPTH};

pub const XADES_NS: &str = "http://uri.etsi.org/01903/v1.3.2#";
pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
pub const SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const SIGNED_PROPERTIES_TYPE: &str = "http://uri.etsi.org/01903#SignedProperties";

/// Values carried by `xades:SignedProperties`.
pub struct SignedPropertiesInput<'a> {
    pub id: &'a str,
    pub signing_time: &'a str,
    pub certificate_digest: &'a str,
    pub issuer: &'a str,
    pub serial: &'a str,
}

fn element(out: &mut String, name: &str, attrs: &[(&str, &str)], text: Option<&str>) {
    out.push('<');
    out.push_str(name);
    for (key, value) in attrs {
        out.push(' ');
        out.push_str(key);
        out.push_str("=\"");
        escape_attr(value, out);
        out.push('"');
    }
    out.push('>');
    if let Some(text) = text {
        escape_text(text, out);
    }
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn digest_method(out: &mut String) {
    element(out, "ds:DigestMethod", &[("Algorithm", SHA256)], None);
}

/// `xades:SignedProperties` with its namespaces declared on the element.
pub fn signed_properties(input: &SignedPropertiesInput<'_>) -> String {
    let mut out = String::new();
    out.push_str("<xades:SignedProperties xmlns:ds=\"");
    out.push_str(DSIG_NS);
    out.push_str("\" xmlns:xades=\"");
    out.push_str(XADES_NS);
    out.push_str("\" Id=\"");
    escape_attr(input.id, &mut out);
    out.push_str("\"><xades:SignedSignatureProperties>");
    element(&mut out, "xades:SigningTime", &[], Some(input.signing_time));
    out.push_str("<xades:SigningCertificate><xades:Cert><xades:CertDigest>");
    digest_method(&mut out);
    element(&mut out, "ds:DigestValue", &[], Some(input.certificate_digest));
    out.push_str("</xades:CertDigest><xades:IssuerSerial>");
    element(&mut out, "ds:X509IssuerName", &[], Some(input.issuer));
    element(&mut out, "ds:X509SerialNumber", &[], Some(input.serial));
    out.push_str("</xades:IssuerSerial></xades:Cert></xades:SigningCertificate>");
    out.push_str("</xades:SignedSignatureProperties></xades:SignedProperties>");
    out
}

/// `ds:SignedInfo` referencing the document and the signed properties.
pub fn signed_info(
    signature_method: &str,
    document_digest: &str,
    properties_id: &str,
    properties_digest: &str,
) -> String {
    let mut out = String::new();
    out.push_str("<ds:SignedInfo xmlns:ds=\"");
    out.push_str(DSIG_NS);
    out.push_str("\">");
    element(&mut out, "ds:CanonicalizationMethod", &[("Algorithm", EXC_C14N)], None);
    element(&mut out, "ds:SignatureMethod", &[("Algorithm", signature_method)], None);

    out.push_str("<ds:Reference Id=\"ref-document\" URI=\"\"><ds:Transforms>");
    element(&mut out, "ds:Transform", &[("Algorithm", ENVELOPED_SIGNATURE)], None);
    element(&mut out, "ds:Transform", &[("Algorithm", EXC_C14N)], None);
    out.push_str("</ds:Transforms>");
    digest_method(&mut out);
    element(&mut out, "ds:DigestValue", &[], Some(document_digest));
    out.push_str("</ds:Reference>");

    let uri = format!("#{}", properties_id);
    out.push_str("<ds:Reference Type=\"");
    out.push_str(SIGNED_PROPERTIES_TYPE);
    out.push_str("\" URI=\"");
    escape_attr(&uri, &mut out);
    out.push_str("\"><ds:Transforms>");
    element(&mut out, "ds:Transform", &[("Algorithm", EXC_C14N)], None);
    out.push_str("</ds:Transforms>");
    digest_method(&mut out);
    element(&mut out, "ds:DigestValue", &[], Some(properties_digest));
    out.push_str("</ds:Reference></ds:SignedInfo>");
    out
}

/// The complete `ds:Signature` element.
pub fn signature(
    signature_id: &str,
    signed_info: &str,
    signature_value: &str,
    certificate_base64: &str,
    signed_properties: &str,
) -> String {
    let mut out = String::new();
    out.push_str("<ds:Signature xmlns:ds=\"");
    out.push_str(DSIG_NS);
    out.push_str("\" Id=\"");
    escape_attr(signature_id, &mut out);
    out.push_str("\">");
    out.push_str(signed_info);
    element(&mut out, "ds:SignatureValue", &[], Some(signature_value));
    out.push_str("<ds:KeyInfo><ds:X509Data>");
    element(&mut out, "ds:X509Certificate", &[], Some(certificate_base64));
    out.push_str("</ds:X509Data></ds:KeyInfo><ds:Object>");
    out.push_str("<xades:QualifyingProperties xmlns:xades=\"");
    out.push_str(XADES_NS);
    out.push_str("\" Target=\"#");
    escape_attr(signature_id, &mut out);
    out.push_str("\">");
    out.push_str(signed_properties);
    out.push_str("</xades:QualifyingProperties></ds:Object></ds:Signature>");
    out
}

/// A `ds:Reference` as found in `ds:SignedInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceFields {
    pub uri: String,
    pub kind: Option<String>,
    pub digest: String,
}

/// Values read back out of a `ds:Signature` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvelopeFields {
    pub signature_method: String,
    pub references: Vec<ReferenceFields>,
    pub signature_value: String,
    pub certificate: String,
    pub signing_time: String,
    pub certificate_digest: String,
    pub issuer: String,
    pub serial: String,
}

impl EnvelopeFields {
    /// Digest of the reference with `URI=""` (the enclosing document).
    pub fn document_digest(&self) -> Option<&str> {
        self.references
            .iter()
            .find(|r| r.uri.is_empty())
            .map(|r| r.digest.as_str())
    }

    /// Digest of the reference pointing at the signed properties.
    pub fn properties_digest(&self) -> Option<&str> {
        self.references
            .iter()
            .find(|r| r.kind.as_deref() == Some(SIGNED_PROPERTIES_TYPE))
            .map(|r| r.digest.as_str())
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, String> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn is_dsig(namespace: &ResolveResult<'_>) -> bool {
    matches!(namespace, ResolveResult::Bound(Namespace(uri)) if *uri == DSIG_NS.as_bytes())
}

/// Reads the first `ds:Signature` element of `xml` that is the root or a
/// child of the root. `Signature` elements in other namespaces or deeper in
/// the tree belong to the document and are skipped.
///
/// Returns `Ok(None)` if there is no signature at all.
pub fn parse_envelope(xml: &str) -> Result<Option<EnvelopeFields>, String> {
    let mut reader = NsReader::from_str(xml);
    let mut fields = EnvelopeFields::default();
    let mut path: Vec<String> = Vec::new();
    let mut inside = false;
    let mut depth = 0usize;
    let mut text = String::new();

    loop {
        let (namespace, event) = reader.read_resolved_event().map_err(|e| e.to_string())?;
        match event {
            Event::Start(e) => {
                depth += 1;
                let name = local_name(&e);
                if !inside && depth <= SIGNATURE_MAX_DEPTH && name == "Signature" && is_dsig(&namespace)
                {
                    inside = true;
                    path.clear();
                }
                if inside {
                    match name.as_str() {
                        "SignatureMethod" => {
                            fields.signature_method = attribute(&e, "Algorithm")?.unwrap_or_default()
                        }
                        "Reference" => fields.references.push(ReferenceFields {
                            uri: attribute(&e, "URI")?.unwrap_or_default(),
                            kind: attribute(&e, "Type")?,
                            digest: String::new(),
                        }),
                        _ => {}
                    }
                    path.push(name);
                    text.clear();
                }
            }
            Event::Empty(e) => {
                if inside && local_name(&e) == "SignatureMethod" {
                    fields.signature_method = attribute(&e, "Algorithm")?.unwrap_or_default();
                }
            }
            Event::Text(t) if inside => {
                text.push_str(&t.unescape().map_err(|e| e.to_string())?);
            }
            Event::End(_) => {
                depth = depth.saturating_sub(1);
                if !inside {
                    continue;
                }
                let name = path.pop().unwrap_or_default();
                let value: String = text.split_whitespace().collect();
                let parent = path.last().map(String::as_str).unwrap_or("");
                match (name.as_str(), parent) {
                    ("DigestValue", "Reference") => {
                        if let Some(reference) = fields.references.last_mut() {
                            reference.digest = value;
                        }
                    }
                    ("DigestValue", "CertDigest") => fields.certificate_digest = value,
                    ("SignatureValue", _) => fields.signature_value = value,
                    ("X509Certificate", _) => fields.certificate = value,
                    ("SigningTime", _) => fields.signing_time = text.trim().to_string(),
                    ("X509IssuerName", _) => fields.issuer = text.trim().to_string(),
                    ("X509SerialNumber", _) => fields.serial = value,
                    ("Signature", _) if path.is_empty() => return Ok(Some(fields)),
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}
