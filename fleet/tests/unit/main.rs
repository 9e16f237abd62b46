//! Integration tests for fleetd

mod common;
mod test_coordinator;
mod test_fsm;
mod test_registry;
