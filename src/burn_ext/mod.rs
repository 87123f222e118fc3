pub mod ctc;
pub mod lstm;
