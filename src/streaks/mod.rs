//! Streak detection and maintenance.
//!
//! Per failing test at a commit, the scanner runs the matcher first (extend
//! a streak that ended one commit earlier) and hands whatever stays
//! unmatched to the detector (confirm a new streak over the lookahead
//! window).

pub mod boundary;
pub mod detector;
pub mod matcher;

pub use detector::{Detection, Rejection, StreakDetector};
pub use matcher::{MatchOutcome, MatchReport, StreakMatcher};
