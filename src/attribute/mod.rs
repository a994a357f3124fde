// Per-entity attribute store

mod store;

pub use store::AttributeStore;
