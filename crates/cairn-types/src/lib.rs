pub mod checksum;
pub mod snapshot_id;
