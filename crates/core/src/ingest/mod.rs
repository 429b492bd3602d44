pub mod quotes;
pub mod screener;
pub mod types;
