pub mod client;
pub mod locate;
pub mod protocol;
pub mod report;
pub mod test_util;
pub mod transport;
