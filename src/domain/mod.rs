// Domain-specific error types
pub mod errors;

// Events published on the engine bus
pub mod events;

// Instrument name model (options, futures, perpetuals)
pub mod instrument;

// Portfolio aggregate
pub mod portfolio;

// Option pricing capability
pub mod pricing;

// Port interfaces
pub mod ports;

// Repository traits
pub mod repositories;
