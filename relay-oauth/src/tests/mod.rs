//! Cross-module integration tests

mod flow_integration;
