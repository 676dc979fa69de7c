pub mod packed_refs;
