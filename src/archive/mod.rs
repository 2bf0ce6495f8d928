//! Archive handling: bundle extraction, inventory files, and the final
//! zip artifact.

mod inventory;
mod zip;

pub use inventory::{
    INVENTORY_FILE_NAME, InventoryError, inventory_headers, parse_inventory, write_inventory,
};
pub use zip::{ArchiveError, pack_dir, unpack_zip};
