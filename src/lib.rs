pub mod about;
pub mod composition;
pub mod container;
pub mod engine;
pub mod error;
pub mod lineage_export;
pub mod plate;
pub mod pooling;
pub mod process;
pub mod registry;
pub mod sample_sheet;
pub mod store;

#[cfg(test)]
mod test_support;
