use crate::okapi::Okapi;
use anyhow::{anyhow, Result};
use json::JsonValue;
use log::{debug, warn};
use reqwest::StatusCode;

const ITEMS_PATH: &str = "/inventory/items";

/// What an exact barcode query returned. FOLIO is supposed to keep item barcodes unique, but
/// duplicates do turn up, so more than one match is kept as its own case instead of taking the first.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    None,
    One(JsonValue),
    Many(Vec<JsonValue>),
}

impl Resolution {
    /// Number of items the query matched.
    pub fn count(&self) -> usize {
        match self {
            Resolution::None => 0,
            Resolution::One(_) => 1,
            Resolution::Many(items) => items.len(),
        }
    }

    fn from_items(mut items: Vec<JsonValue>) -> Self {
        match items.len() {
            0 => Resolution::None,
            1 => Resolution::One(items.remove(0)),
            _ => Resolution::Many(items),
        }
    }
}

/// Quote a value as a CQL string term. Backslash, double quote, and the CQL masking
/// characters are escaped so the value only ever matches itself.
pub fn cql_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '\\' | '"' | '*' | '?' | '^') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Look up the items whose barcode is exactly `barcode`.
pub async fn get_item_by_barcode<C: Okapi + ?Sized>(client: &C, barcode: &str) -> Result<Resolution> {
    // Exact match on the quoted barcode
    let query = format!("barcode=={}", cql_quote(barcode));
    let mut response = client.get(ITEMS_PATH, &query).await?;
    // Take the items out of the response, they become the resolution
    let items = match response.remove("items") {
        JsonValue::Array(items) => items,
        _ => return Err(anyhow!("malformed item search response for barcode {}: no items array", barcode)),
    };
    // The returned items decide the count, but a disagreeing total is worth knowing about
    if let Some(total) = response["totalRecords"].as_usize() {
        if total != items.len() {
            warn!("barcode {}: totalRecords is {} but {} items were returned", barcode, total, items.len());
        }
    }
    debug!("barcode {} matched {} items", barcode, items.len());
    Ok(Resolution::from_items(items))
}

/// Remove the `permanentLocation` from an item record and return it, or `None` if the item didn't have one.
pub fn delete_permanent_location(item: &mut JsonValue) -> Option<JsonValue> {
    match item.remove("permanentLocation") {
        // `remove` gives back null when the key isn't there
        JsonValue::Null => None,
        location => Some(location),
    }
}

/// Escape the characters that would change the meaning of a url path segment.
fn path_segment(value: &str) -> String {
    value.replace('%', "%25").replace('/', "%2F").replace('?', "%3F").replace('#', "%23")
}

/// PUT an updated item back to inventory, returning the status code and response body untouched.
pub async fn put_item<C: Okapi + ?Sized>(client: &C, item: JsonValue) -> Result<(StatusCode, String)> {
    // The id from the record itself names the item to replace
    let id = item["id"].as_str().ok_or_else(|| anyhow!("item record has no id"))?;
    let path = format!("{}/{}", ITEMS_PATH, path_segment(id));
    client.put(&path, item).await
}
