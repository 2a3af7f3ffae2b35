use crate::{
    items::{delete_permanent_location, get_item_by_barcode, put_item, Resolution},
    okapi::Okapi,
};
use anyhow::{Error, Result};
use json::JsonValue;
use log::{error, info, warn};
use reqwest::StatusCode;
use std::io;

/// How a row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    /// The location was removed and the item saved.
    Updated,
    NotFound,
    /// More than one item shares the barcode; nothing was changed.
    Ambiguous,
    NoLocation,
    /// Okapi answered the PUT with a non-success status.
    Rejected,
    BackendError,
}

/// The result for one input row, written out as `barcode<TAB>status<TAB>message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowOutcome {
    pub barcode: String,
    pub state: RowState,
    /// Status of the PUT, if one was sent.
    pub status: Option<StatusCode>,
    pub message: String,
}

impl RowOutcome {
    fn new(barcode: &str, state: RowState, status: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self { barcode: barcode.to_owned(), state, status, message: message.into() }
    }

    /// The output columns. Rows where nothing was written get a status of 0.
    pub fn record(&self) -> [String; 3] {
        [self.barcode.clone(), self.status.map_or(0, |s| s.as_u16()).to_string(), self.message.clone()]
    }
}

/// Row counts for a whole run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopSummary {
    pub rows: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl LoopSummary {
    fn add(&mut self, state: RowState) {
        self.rows += 1;
        match state {
            RowState::Updated => self.updated += 1,
            RowState::NotFound | RowState::Ambiguous | RowState::NoLocation => self.skipped += 1,
            RowState::Rejected | RowState::BackendError => self.errors += 1,
        }
    }
}

/// Tab separated reader with no header row, tolerating rows with differing column counts.
pub fn tsv_reader<R: io::Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new().delimiter(b'\t').has_headers(false).flexible(true).from_reader(input)
}

pub fn tsv_writer<W: io::Write>(output: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(output)
}

/// The name to report for a removed location.
fn location_name(location: &JsonValue) -> String {
    match location["name"].as_str() {
        Some(name) => name.to_owned(),
        None => location.dump(),
    }
}

/// Look up the item for `barcode`, remove its permanent location, and save it. Never fails:
/// every problem becomes the outcome for this row.
pub async fn process_barcode<C: Okapi + ?Sized>(client: &C, barcode: &str) -> RowOutcome {
    // Nothing to look up
    if barcode.is_empty() {
        return RowOutcome::new(barcode, RowState::NotFound, None, "No barcode in row");
    }
    match strip_location(client, barcode).await {
        Ok(outcome) => outcome,
        // A backend failure only costs this row
        Err(error) => {
            error!("barcode {}: {:#}", barcode, error);
            backend_error(barcode, error)
        }
    }
}

fn backend_error(barcode: &str, error: Error) -> RowOutcome {
    RowOutcome::new(barcode, RowState::BackendError, None, format!("{:#}", error))
}

async fn strip_location<C: Okapi + ?Sized>(client: &C, barcode: &str) -> Result<RowOutcome> {
    // Find the item, refusing to pick one when the barcode isn't unique
    let mut item = match get_item_by_barcode(client, barcode).await? {
        Resolution::None => {
            return Ok(RowOutcome::new(
                barcode,
                RowState::NotFound,
                None,
                format!("No item matching barcode {}", barcode),
            ))
        }
        Resolution::Many(items) => {
            warn!("barcode {} matched {} items, leaving them alone", barcode, items.len());
            return Ok(RowOutcome::new(
                barcode,
                RowState::Ambiguous,
                None,
                format!("{} items matched barcode {}", items.len(), barcode),
            ));
        }
        Resolution::One(item) => item,
    };
    // Strip the location, keeping it to report what was removed
    let old_location = match delete_permanent_location(&mut item) {
        Some(location) => location,
        None => return Ok(RowOutcome::new(barcode, RowState::NoLocation, None, "Item had no permanentLocation")),
    };
    // Save the stripped item; only a 2xx status counts as saved
    let (status, body) = put_item(client, item).await?;
    if status.is_success() {
        Ok(RowOutcome::new(barcode, RowState::Updated, Some(status), location_name(&old_location)))
    } else {
        let message = if body.trim().is_empty() { format!("HTTP {}", status) } else { body };
        Ok(RowOutcome::new(barcode, RowState::Rejected, Some(status), message))
    }
}

/// Remove the permanent location of the item for each barcode in the first column of `input`,
/// writing one row per barcode to `output`. Rows are independent: a failed row is reported
/// and the loop moves on. Only failing to read the input or write the output stops the run.
pub async fn delete_location_loop<C, R, W>(
    client: &C,
    input: &mut csv::Reader<R>,
    output: &mut csv::Writer<W>,
) -> Result<LoopSummary>
where
    C: Okapi + ?Sized,
    R: io::Read,
    W: io::Write,
{
    let mut summary = LoopSummary::default();
    for row in input.records() {
        let row = row?;
        // The barcode is in the first column, anything after it is ignored
        let cell = row.get(0).unwrap_or("");
        // Look up the trimmed barcode, but echo the cell as it was written
        let mut outcome = process_barcode(client, cell.trim()).await;
        outcome.barcode = cell.to_owned();
        info!("barcode {}: {:?}", cell, outcome.state);
        // Write and flush each row as soon as it is done
        output.write_record(&outcome.record())?;
        output.flush()?;
        summary.add(outcome.state);
    }
    Ok(summary)
}
