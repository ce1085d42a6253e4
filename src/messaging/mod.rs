mod kafka;

pub use kafka::{DecodeOutcome, IngestOutcome, Ingestor, OrderConsumer, ReassemblyBuffer};
