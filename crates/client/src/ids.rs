use uuid::Uuid;

/// Generate a fresh globally-unique identifier for a concern or comment.
///
/// Identifiers are assigned once and never regenerated: a snapshot record
/// or inbound message that already carries an id keeps it.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_non_empty() {
        let a = new_id();
        let b = new_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
