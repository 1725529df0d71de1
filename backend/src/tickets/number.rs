// Ticket number generation

use chrono::{DateTime, Utc};
use rand::Rng;

/// How many fresh suffixes to try when the unique index rejects a number.
pub const MAX_NUMBER_ATTEMPTS: u32 = 3;

/// Generate a human-readable ticket number: `TK-YYYYMMDD-HHMMSS-NNN`.
///
/// NNN is a zero-padded random 0-999. Collisions within the same second are
/// possible; callers catch the unique violation and retry with a fresh
/// suffix.
pub fn generate(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("TK-{}-{:03}", now.format("%Y%m%d-%H%M%S"), suffix)
}

/// Whether a Postgres error is the unique-violation raised by a number clash.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn number_format_is_bit_exact() {
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 14, 30, 59).unwrap();
        let number = generate(now);

        assert_eq!(number.len(), "TK-20250307-143059-000".len());
        assert!(number.starts_with("TK-20250307-143059-"));

        let suffix = &number[number.len() - 3..];
        assert_eq!(suffix.len(), 3);
        let n: u16 = suffix.parse().expect("suffix must be numeric");
        assert!(n < 1000);
    }

    #[test]
    fn suffix_is_zero_padded() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        for _ in 0..50 {
            let number = generate(now);
            assert_eq!(number.len(), 22, "padding must keep numbers fixed-width: {number}");
        }
    }
}
