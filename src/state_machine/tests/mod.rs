//! State machine scenario tests.

mod distributed;
pub mod utils;
