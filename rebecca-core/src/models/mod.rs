pub mod turn;
pub mod user;

pub use turn::{Turn, TurnRow};
pub use user::User;
