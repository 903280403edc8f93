#![allow(dead_code)]

pub use stagehand_test_utils::{WAIT, builders, fakes, init_tracing, with_timeout};
