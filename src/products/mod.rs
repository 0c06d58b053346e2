pub mod hedgebox;
pub mod pulse;
