pub mod mock_news;
pub mod rss;
pub mod sentiment;
