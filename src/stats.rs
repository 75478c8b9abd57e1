use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{AttendanceRecord, AttendanceStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseStats {
    pub course_id: Uuid,
    pub course_name: String,
    pub course_code: String,
    pub attended: u32,
    pub total: u32,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceStats {
    pub per_course: Vec<CourseStats>,
    pub attended: u32,
    pub total: u32,
    pub percentage: u8,
}

/// Percentage of classes attended, rounded to the nearest integer.
/// Zero classes is 0%, not a division error.
pub fn percentage(attended: u32, total: u32) -> u8 {
    if total == 0 {
        return 0;
    }
    ((attended as f64 / total as f64) * 100.0).round() as u8
}

/// Per-course and aggregate roll-up over a student's records. Pure and
/// idempotent; callers re-run it after every refresh of the record list.
pub fn compute_stats(records: &[AttendanceRecord]) -> AttendanceStats {
    let mut grouped: BTreeMap<Uuid, CourseStats> = BTreeMap::new();

    for record in records {
        let entry = grouped.entry(record.course_id).or_insert_with(|| CourseStats {
            course_id: record.course_id,
            course_name: record.course_name.clone(),
            course_code: record.course_code.clone(),
            attended: 0,
            total: 0,
            percentage: 0,
        });
        entry.total += 1;
        if record.status == AttendanceStatus::Present {
            entry.attended += 1;
        }
    }

    let mut attended = 0u32;
    let mut total = 0u32;
    let mut per_course: Vec<CourseStats> = grouped.into_values().collect();
    for course in per_course.iter_mut() {
        course.percentage = percentage(course.attended, course.total);
        attended += course.attended;
        total += course.total;
    }
    per_course.sort_by(|a, b| a.course_code.cmp(&b.course_code));

    AttendanceStats {
        per_course,
        attended,
        total,
        percentage: percentage(attended, total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn record(course: Uuid, code: &str, day: u32, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            id: Uuid::new_v4(),
            student_id: Uuid::new_v4(),
            student_name: "Jane Smith".to_string(),
            student_email: "jane@student.edu".to_string(),
            course_id: course,
            course_name: format!("Course {}", code),
            course_code: code.to_string(),
            marked_on: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            status,
            marked_at: Utc::now(),
            session_token: String::new(),
        }
    }

    #[test]
    fn empty_history_is_zero_percent() {
        let stats = compute_stats(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.percentage, 0);
        assert!(stats.per_course.is_empty());
    }

    #[test]
    fn percentage_stays_in_bounds() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(0, 7), 0);
        assert_eq!(percentage(7, 7), 100);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
        for attended in 0..=50 {
            let p = percentage(attended, 50);
            assert!(p <= 100);
        }
    }

    #[test]
    fn groups_by_course_and_aggregates() {
        let cs101 = Uuid::new_v4();
        let math = Uuid::new_v4();
        let records = vec![
            record(cs101, "CS101", 1, AttendanceStatus::Present),
            record(cs101, "CS101", 2, AttendanceStatus::Present),
            record(cs101, "CS101", 3, AttendanceStatus::Absent),
            record(math, "MATH201", 1, AttendanceStatus::Present),
        ];

        let stats = compute_stats(&records);
        assert_eq!(stats.per_course.len(), 2);
        assert_eq!(stats.per_course[0].course_code, "CS101");
        assert_eq!(stats.per_course[0].attended, 2);
        assert_eq!(stats.per_course[0].total, 3);
        assert_eq!(stats.per_course[0].percentage, 67);
        assert_eq!(stats.per_course[1].percentage, 100);

        assert_eq!(stats.attended, 3);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.percentage, 75);
    }

    #[test]
    fn recomputing_changes_nothing() {
        let course = Uuid::new_v4();
        let records = vec![
            record(course, "PHY101", 1, AttendanceStatus::Present),
            record(course, "PHY101", 2, AttendanceStatus::Absent),
        ];
        let first = compute_stats(&records);
        let second = compute_stats(&records);
        assert_eq!(first, second);
    }
}
