//! Builds the human readable attestation the wallet signs to request a
//! withdrawal. The relay rebuilds the same text on its side to verify the
//! signature, so the wording and the timestamp format must stay byte-exact.

use crate::types::ItemId;
use std::sync::Arc;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};

/// Expiry is aligned to this granularity.
pub const EXPIRY_GRANULARITY: Duration = Duration::minutes(10);
/// Number of granularity steps added on top of the current (floored) step.
const EXPIRY_STEPS: i64 = 2;

/// Matches JavaScript's `Date.prototype.toISOString`.
const ISO_MILLIS: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

/// Source of the current time.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> OffsetDateTime + Send + Sync>);

impl Clock {
    pub fn real() -> Self {
        Clock(Arc::new(OffsetDateTime::now_utc))
    }

    pub fn fixed(now: OffsetDateTime) -> Self {
        Clock(Arc::new(move || now))
    }

    pub fn now(&self) -> OffsetDateTime {
        (self.0)()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Clock").field(&self.now()).finish()
    }
}

/// Returns the expiry for a message generated at `now`: the current
/// 10-minute boundary plus two more steps, which leaves between 10 and 20
/// minutes of validity.
pub fn expiry_for(now: OffsetDateTime) -> OffsetDateTime {
    let step_millis = EXPIRY_GRANULARITY.whole_milliseconds();
    let step = (now.unix_timestamp_nanos() / 1_000_000).div_euclid(step_millis);
    let expiry_nanos = (step + EXPIRY_STEPS as i128) * step_millis * 1_000_000;
    OffsetDateTime::from_unix_timestamp_nanos(expiry_nanos).unwrap_or(now + EXPIRY_GRANULARITY * 2)
}

pub fn format_expiry(expiry: OffsetDateTime) -> String {
    expiry
        .format(ISO_MILLIS)
        .unwrap_or_else(|_| expiry.unix_timestamp().to_string())
}

/// Formats the withdrawal attestation for `item_ids`, in the given order.
pub fn build_withdrawal_message(item_ids: &[ItemId], now: OffsetDateTime) -> String {
    let plural = if item_ids.len() > 1 { "s" } else { "" };
    let joined = item_ids
        .iter()
        .map(ItemId::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let expires_at = format_expiry(expiry_for(now));
    format!(
        "I would like to withdraw the following item{plural}: {joined} \n\n\
         Signing this message does not cost gas. \n\n\
         This signature expires at: {expires_at}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::macros::datetime;
    use time::PrimitiveDateTime;

    fn ids(values: &[&str]) -> Vec<ItemId> {
        values.iter().copied().map(ItemId::from).collect()
    }

    fn parse_expiry(message: &str) -> OffsetDateTime {
        let (_, stamp) = message
            .rsplit_once("This signature expires at: ")
            .expect("message has an expiry");
        PrimitiveDateTime::parse(stamp.trim_end_matches('Z'), format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .expect("expiry parses")
        .assume_utc()
    }

    #[test]
    fn single_item_message_is_exact() {
        let message = build_withdrawal_message(&ids(&["0xaa"]), datetime!(2024-03-01 12:34:56.789 UTC));
        assert_eq!(
            message,
            "I would like to withdraw the following item: 0xaa \n\n\
             Signing this message does not cost gas. \n\n\
             This signature expires at: 2024-03-01T12:50:00.000Z"
        );
    }

    #[test]
    fn multiple_items_are_joined_in_order() {
        let message = build_withdrawal_message(
            &ids(&["0x03", "0x01", "0x02"]),
            datetime!(2024-03-01 12:00:00 UTC),
        );
        assert!(message.starts_with(
            "I would like to withdraw the following items: 0x03, 0x01, 0x02 \n\n"
        ));
        for id in ["0x01", "0x02", "0x03"] {
            assert_eq!(message.matches(id).count(), 1);
        }
    }

    #[rstest]
    #[case::on_boundary(datetime!(2024-03-01 12:00:00 UTC), datetime!(2024-03-01 12:20:00 UTC))]
    #[case::just_after_boundary(datetime!(2024-03-01 12:00:00.001 UTC), datetime!(2024-03-01 12:20:00 UTC))]
    #[case::just_before_boundary(datetime!(2024-03-01 12:09:59.999 UTC), datetime!(2024-03-01 12:20:00 UTC))]
    #[case::crosses_midnight(datetime!(2024-12-31 23:55:00 UTC), datetime!(2025-01-01 00:10:00 UTC))]
    fn expiry_is_rounded_to_boundary(#[case] now: OffsetDateTime, #[case] expected: OffsetDateTime) {
        assert_eq!(expiry_for(now), expected);
    }

    #[rstest]
    #[case(datetime!(2024-03-01 08:00:00 UTC))]
    #[case(datetime!(2024-03-01 08:04:13.5 UTC))]
    #[case(datetime!(2024-03-01 08:09:59.999 UTC))]
    fn expiry_leaves_ten_to_twenty_minutes(#[case] now: OffsetDateTime) {
        let expiry = parse_expiry(&build_withdrawal_message(&ids(&["0x1", "0x2"]), now));
        let validity = expiry - now;
        assert!(validity > Duration::minutes(10), "validity {validity}");
        assert!(validity <= Duration::minutes(20), "validity {validity}");
        assert_eq!(expiry.minute() % 10, 0);
        assert_eq!(expiry.second(), 0);
        assert_eq!(expiry.millisecond(), 0);
    }

    #[test]
    fn expiry_is_recomputed_on_every_build() {
        let item_ids = ids(&["0x1"]);
        let first = build_withdrawal_message(&item_ids, datetime!(2024-03-01 08:00:00 UTC));
        let later = build_withdrawal_message(&item_ids, datetime!(2024-03-01 08:10:00 UTC));
        assert_ne!(first, later);
    }

    #[test]
    fn fixed_clock_returns_its_instant() {
        let instant = datetime!(2024-03-01 08:00:00 UTC);
        assert_eq!(Clock::fixed(instant).now(), instant);
    }
}
