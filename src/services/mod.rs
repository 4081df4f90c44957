pub mod alerting;
pub mod calibration;
pub mod forecast;
pub mod hydraulic;
pub mod ingest;
pub mod pipeline;
pub mod qc;
pub mod scheduler;
pub mod subscribe;
pub mod weather;
