use haven_types::Timestamp;
use std::time::Duration;

#[test]
fn now_is_after_epoch() {
    assert!(Timestamp::now() > Timestamp::EPOCH);
}

#[test]
fn from_millis_roundtrip() {
    let ts = Timestamp::from_millis(1_000);
    assert_eq!(ts.as_millis(), 1_000);
    assert_eq!(Timestamp::from(1_000), ts);
}

#[test]
fn ordering_follows_millis() {
    assert!(Timestamp::from_millis(100) < Timestamp::from_millis(200));
}

#[test]
fn saturating_add_shifts_forward() {
    let ts = Timestamp::from_millis(1_000);
    assert_eq!(ts.saturating_add(Duration::from_secs(5)).as_millis(), 6_000);
}

#[test]
fn saturating_add_does_not_overflow() {
    let ts = Timestamp::from_millis(u64::MAX - 1);
    assert_eq!(ts.saturating_add(Duration::from_secs(1)).as_millis(), u64::MAX);
}

#[test]
fn duration_since_earlier() {
    let a = Timestamp::from_millis(1_000);
    let b = Timestamp::from_millis(4_500);
    assert_eq!(b.saturating_duration_since(a), Duration::from_millis(3_500));
}

#[test]
fn duration_since_later_is_zero() {
    let a = Timestamp::from_millis(1_000);
    let b = Timestamp::from_millis(4_500);
    assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
}

#[test]
fn serializes_as_number() {
    let json = serde_json::to_string(&Timestamp::from_millis(42)).unwrap();
    assert_eq!(json, "42");
    let back: Timestamp = serde_json::from_str("42").unwrap();
    assert_eq!(back.as_millis(), 42);
}

#[test]
fn display_includes_unit() {
    assert_eq!(Timestamp::from_millis(7).to_string(), "7ms");
}
