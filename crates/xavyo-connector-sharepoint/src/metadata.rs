//! Item row attributes to document metadata.

use crate::model::ItemRow;
use crate::response::DocResponse;

/// Object type of the document.
pub const METADATA_OBJECT_TYPE: &str = "google:objecttype";
/// Id of the list containing the document.
pub const METADATA_LIST_GUID: &str = "sharepoint:listguid";
/// Title of the web containing the document.
pub const METADATA_PARENT_WEB_TITLE: &str = "sharepoint:parentwebtitle";

/// Replaces `_xHHHH_` escapes (lowercase hex) with the character they encode.
pub fn decode_metadata_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    while let Some(idx) = rest.find("_x") {
        out.push_str(&rest[..idx]);
        let candidate = &rest[idx..];
        match decode_escape(candidate) {
            Some(c) => {
                out.push(c);
                rest = &candidate[7..];
            }
            None => {
                out.push_str("_x");
                rest = &candidate[2..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_escape(s: &str) -> Option<char> {
    let bytes = s.as_bytes();
    if bytes.len() < 7 || bytes[6] != b'_' {
        return None;
    }
    let hex = &s[2..6];
    if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
}

/// Splits a raw attribute value into its metadata values.
///
/// Lookup values (`12;#pi;#42;#answer`) keep only the text parts and
/// multi-choice values (`;#a;#b;#`) are split; anything else is one value.
pub fn metadata_values(value: &str) -> Vec<String> {
    if is_lookup_value(value) {
        value
            .split(";#")
            .skip(1)
            .step_by(2)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    } else if value.starts_with(";#") && value.ends_with(";#") {
        value
            .split(";#")
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![value.to_string()]
    }
}

fn is_lookup_value(value: &str) -> bool {
    match value.find(";#") {
        Some(idx) if idx > 0 => value[..idx].bytes().all(|b| b.is_ascii_digit()),
        _ => false,
    }
}

/// Adds one row attribute to `response` under its decoded name.
pub fn add_metadata(response: &mut DocResponse, name: &str, value: &str) {
    if name == "ows_MetaInfo" {
        return;
    }
    let name = decode_metadata_name(name.strip_prefix("ows_").unwrap_or(name));
    for value in metadata_values(value) {
        response.add_metadata(name.clone(), value);
    }
}

pub fn add_row_metadata(response: &mut DocResponse, row: &ItemRow) {
    for (name, value) in &row.attributes {
        add_metadata(response, name, value);
    }
}
