//! Remove the permanent location from FOLIO inventory items, looked up by barcode through Okapi.

pub mod config;
pub mod driver;
pub mod items;
pub mod okapi;

pub use config::{Config, ConfigError};
pub use driver::{delete_location_loop, process_barcode, LoopSummary, RowOutcome, RowState};
pub use items::{delete_permanent_location, get_item_by_barcode, put_item, Resolution};
pub use okapi::{Okapi, OkapiClient, OkapiError};
