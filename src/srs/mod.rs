pub mod card_selector;
pub mod interval;
pub mod overdue;
pub mod review;

pub use card_selector::select_card;
pub use overdue::{overdueness, progress_score, rank_by_overdueness};
pub use review::{review_reducer, ReviewAction, ReviewPhase, ReviewState};
