pub mod lorem;
pub mod mock;

pub use lorem::LoremProvider;
pub use mock::{mock_metadata, LiveFeed, MockProvider, MockResponse};
