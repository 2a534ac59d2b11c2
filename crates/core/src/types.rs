/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Zero-padded decimal run identifier, e.g. `"0042"`.
pub type RunId = String;

/// Current time, truncated to whole seconds so that serialized ledgers stay
/// stable and human-readable.
pub fn now() -> Timestamp {
    use chrono::SubsecRound;
    chrono::Utc::now().trunc_subsecs(0)
}
