use ulid::Ulid;

use crate::model::Reservation;

/// Outcome of weighing a candidate against the reservations it overlaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Admit the candidate and cancel every listed reservation.
    Admit { preempt: Vec<Ulid> },
    /// Leave everything as is. `blocking_code` is the first reservation that held its ground.
    Reject { blocking_code: String },
}

/// Priority admission.
///
/// Each overlapping reservation is weighed in order: a strictly lower priority is
/// marked for preemption, anything else rejects the whole candidate on the spot.
/// Ties never preempt.
pub fn admit<'a>(
    candidate_priority: i32,
    overlapping: impl IntoIterator<Item = &'a Reservation>,
) -> Admission {
    let mut preempt = Vec::new();
    for existing in overlapping {
        if candidate_priority > existing.priority {
            preempt.push(existing.id);
        } else {
            return Admission::Reject {
                blocking_code: existing.code.clone(),
            };
        }
    }
    Admission::Admit { preempt }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone, Utc};

    fn booked(code: &str, priority: i32) -> Reservation {
        let tz = FixedOffset::east_opt(0).unwrap();
        let now = Utc::now();
        Reservation {
            id: Ulid::new(),
            code: code.into(),
            room_id: Ulid::new(),
            group_id: 1,
            link_id: None,
            start: tz.with_ymd_and_hms(2025, 10, 27, 10, 0, 0).unwrap(),
            end: tz.with_ymd_and_hms(2025, 10, 27, 11, 0, 0).unwrap(),
            purpose: "lab".into(),
            priority,
            created_by: 1,
            updated_by: None,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
            cancelled_by: None,
            preempted_by: None,
        }
    }

    #[test]
    fn nothing_overlapping_admits() {
        assert_eq!(admit(0, []), Admission::Admit { preempt: vec![] });
    }

    #[test]
    fn higher_priority_preempts_all_lower() {
        let a = booked("A", 1);
        let b = booked("B", 2);
        let decision = admit(3, [&a, &b]);
        assert_eq!(decision, Admission::Admit { preempt: vec![a.id, b.id] });
    }

    #[test]
    fn tie_rejects() {
        let a = booked("A", 5);
        assert_eq!(
            admit(5, [&a]),
            Admission::Reject { blocking_code: "A".into() }
        );
    }

    #[test]
    fn lower_priority_rejects() {
        let a = booked("A", 5);
        assert_eq!(
            admit(1, [&a]),
            Admission::Reject { blocking_code: "A".into() }
        );
    }

    #[test]
    fn first_blocker_short_circuits() {
        let low = booked("LOW", 1);
        let high = booked("HIGH", 9);
        let also_high = booked("HIGH2", 9);
        assert_eq!(
            admit(5, [&low, &high, &also_high]),
            Admission::Reject { blocking_code: "HIGH".into() }
        );
    }

    #[test]
    fn negative_priorities_compare_normally() {
        let a = booked("A", -3);
        assert_eq!(admit(-1, [&a]), Admission::Admit { preempt: vec![a.id] });
    }
}
