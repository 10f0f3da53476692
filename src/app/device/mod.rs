pub mod locator;
pub mod pairing;
pub mod parse;
pub mod wifi;
