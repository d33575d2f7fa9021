pub mod card;
pub mod note;
pub mod review;

pub use card::{AvailableCards, Card, CardPatch, Progress, ProgressPatch, MS_PER_DAY};
pub use note::{Note, NotePatch};
pub use review::{HistoryEntry, ReplayedReview, ReviewOutcome, ReviewSummary};
