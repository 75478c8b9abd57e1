use std::collections::BTreeMap;

use axum::body::{boxed, Bytes, Full};
use axum::extract::{Path, Query};
use axum::http::header;
use axum::response::Response;
use axum::{Extension, Json};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::authenticate;
use crate::courses::{find_course, owned_course};
use crate::err::Error;
use crate::models::{AttendanceRecord, Course, Role, UserProfile};
use crate::{proceeds, Payload};

const DEFAULT_WINDOW_DAYS: i64 = 30;
const MAX_WINDOW_DAYS: i64 = 365;

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyticsQuery {
    pub ssid: String,
    pub days: Option<i64>,
}

impl AnalyticsQuery {
    fn window(&self) -> i64 {
        self.days.unwrap_or(DEFAULT_WINDOW_DAYS).clamp(1, MAX_WINDOW_DAYS)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayCount {
    pub date: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekCount {
    pub week_start: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentPerformance {
    pub student_id: Uuid,
    pub student_name: String,
    pub attendance_count: u32,
}

/// Check-ins per day, date-ascending.
pub fn daily_trends(records: &[AttendanceRecord]) -> Vec<DayCount> {
    let mut days: BTreeMap<NaiveDate, u32> = BTreeMap::new();
    for record in records {
        *days.entry(record.marked_on).or_default() += 1;
    }
    days.into_iter()
        .map(|(date, count)| DayCount { date, count })
        .collect()
}

/// Check-ins bucketed by the Monday that starts their week.
pub fn weekly_breakdown(records: &[AttendanceRecord]) -> Vec<WeekCount> {
    let mut weeks: BTreeMap<NaiveDate, u32> = BTreeMap::new();
    for record in records {
        let offset = record.marked_on.weekday().num_days_from_monday() as i64;
        let week_start = record.marked_on - Duration::days(offset);
        *weeks.entry(week_start).or_default() += 1;
    }
    weeks
        .into_iter()
        .map(|(week_start, count)| WeekCount { week_start, count })
        .collect()
}

/// Compares check-in volume in the earlier and later halves of the window.
/// A swing of more than 10% either way counts as a trend.
pub fn trend(records: &[AttendanceRecord], now: DateTime<Utc>, window_days: i64) -> Trend {
    if records.len() < 2 {
        return Trend::Stable;
    }
    let midpoint = now - Duration::days(window_days / 2);
    let second: u32 = records
        .iter()
        .filter(|record| record.marked_at >= midpoint)
        .count() as u32;
    let first = records.len() as u32 - second;

    let second = f64::from(second);
    let first = f64::from(first);
    if second > first * 1.1 {
        Trend::Increasing
    } else if second < first * 0.9 {
        Trend::Decreasing
    } else {
        Trend::Stable
    }
}

/// Average attendance rate: check-ins over the number of slots the course
/// offered (class days times enrolled students). Zero of either is 0%.
pub fn attendance_rate(attendance: u32, class_days: u32, students: u32) -> u8 {
    let slots = class_days as u64 * students as u64;
    if slots == 0 {
        return 0;
    }
    ((attendance as f64 / slots as f64) * 100.0).round() as u8
}

/// Distinct days on which anyone checked in; with no persisted session
/// history these stand in for the number of classes held.
pub fn class_days(records: &[AttendanceRecord]) -> u32 {
    let mut days: Vec<NaiveDate> = records.iter().map(|record| record.marked_on).collect();
    days.sort_unstable();
    days.dedup();
    days.len() as u32
}

/// Per-student check-in counts, best attenders first.
pub fn student_performance(records: &[AttendanceRecord]) -> Vec<StudentPerformance> {
    let mut students: BTreeMap<Uuid, StudentPerformance> = BTreeMap::new();
    for record in records {
        students
            .entry(record.student_id)
            .or_insert_with(|| StudentPerformance {
                student_id: record.student_id,
                student_name: record.student_name.clone(),
                attendance_count: 0,
            })
            .attendance_count += 1;
    }
    let mut ranked: Vec<StudentPerformance> = students.into_values().collect();
    ranked.sort_by(|a, b| {
        b.attendance_count
            .cmp(&a.attendance_count)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });
    ranked
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseAnalytics {
    pub course_id: Uuid,
    pub course_name: String,
    pub course_code: String,
    pub window_days: i64,
    pub total_students: i64,
    pub class_days: u32,
    pub total_attendance: u32,
    pub avg_attendance_rate: u8,
    pub student_performance: Vec<StudentPerformance>,
    pub daily_trends: Vec<DayCount>,
    pub trend: Trend,
}

async fn course_records_since(
    pg: &PgPool,
    course_id: Uuid,
    cutoff: DateTime<Utc>,
) -> Result<Vec<AttendanceRecord>, Error> {
    sqlx::query_as::<_, AttendanceRecord>(
        "SELECT * FROM attendance WHERE course_id = $1 AND marked_at >= $2
         ORDER BY marked_at DESC",
    )
    .bind(course_id)
    .bind(cutoff)
    .fetch_all(pg)
    .await
    .map_err(Error::from)
}

/// Resolves the course for an analytics caller: owning lecturer or admin.
async fn course_for_caller(
    pg: &PgPool,
    caller: &UserProfile,
    course_id: Uuid,
) -> Result<Course, Error> {
    match caller.role {
        Role::Lecturer => owned_course(pg, course_id, caller.uid).await,
        Role::Admin => find_course(pg, course_id).await?.ok_or(Error::NotFound {
            message: format!("No course exists with id `{}`", course_id),
        }),
        Role::Student => Err(Error::unauthorized(
            "Course analytics are for lecturers and administrators",
        )),
    }
}

pub async fn course(
    Path(course_id): Path<Uuid>,
    Query(q): Query<AnalyticsQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<CourseAnalytics> {
    let caller = authenticate(&q.ssid, &pg).await?;
    let course = course_for_caller(&pg, &caller, course_id).await?;

    let window = q.window();
    let now = Utc::now();
    let records = course_records_since(&pg, course.id, now - Duration::days(window)).await?;

    let (total_students,) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM enrollments WHERE course_id = $1",
    )
    .bind(course.id)
    .fetch_one(&pg)
    .await
    .map_err(Error::from)?;

    let days_held = class_days(&records);
    proceeds(CourseAnalytics {
        course_id: course.id,
        course_name: course.name,
        course_code: course.code,
        window_days: window,
        total_students,
        class_days: days_held,
        total_attendance: records.len() as u32,
        avg_attendance_rate: attendance_rate(
            records.len() as u32,
            days_held,
            total_students as u32,
        ),
        student_performance: student_performance(&records),
        daily_trends: daily_trends(&records),
        trend: trend(&records, now, window),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseActivity {
    pub course_id: Uuid,
    pub course_name: String,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudentAnalytics {
    pub window_days: i64,
    pub total_attendance: u32,
    pub weekly_data: Vec<WeekCount>,
    pub course_breakdown: Vec<CourseActivity>,
    pub trend: Trend,
}

/// The student's own activity: weekly volume, busiest courses, trend.
pub async fn student(
    Query(q): Query<AnalyticsQuery>,
    Extension(pg): Extension<PgPool>,
) -> Payload<StudentAnalytics> {
    let student = authenticate(&q.ssid, &pg).await?;
    student.ensure_role(Role::Student)?;

    let window = q.window();
    let now = Utc::now();
    let records = sqlx::query_as::<_, AttendanceRecord>(
        "SELECT * FROM attendance WHERE student_id = $1 AND marked_at >= $2
         ORDER BY marked_at DESC",
    )
    .bind(student.uid)
    .bind(now - Duration::days(window))
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    let mut courses: BTreeMap<Uuid, CourseActivity> = BTreeMap::new();
    for record in &records {
        courses
            .entry(record.course_id)
            .or_insert_with(|| CourseActivity {
                course_id: record.course_id,
                course_name: record.course_name.clone(),
                count: 0,
            })
            .count += 1;
    }
    let mut course_breakdown: Vec<CourseActivity> = courses.into_values().collect();
    course_breakdown.sort_by(|a, b| b.count.cmp(&a.count));

    proceeds(StudentAnalytics {
        window_days: window,
        total_attendance: records.len() as u32,
        weekly_data: weekly_breakdown(&records),
        course_breakdown,
        trend: trend(&records, now, window),
    })
}

/// Quotes a CSV field when it contains a delimiter, quote, or newline.
fn csv_field(raw: &str) -> String {
    if raw.contains(&[',', '"', '\n', '\r'][..]) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_row(fields: &[&str]) -> String {
    let mut row = fields
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",");
    row.push('\n');
    row
}

/// The course report: a summary preamble, per-student ranking, and every
/// check-in row. Built entirely from the denormalized attendance rows.
pub fn course_report_csv(
    course: &Course,
    total_students: i64,
    records: &[AttendanceRecord],
    generated_at: DateTime<Utc>,
) -> String {
    let days_held = class_days(records);
    let rate = attendance_rate(records.len() as u32, days_held, total_students as u32);

    let mut out = String::new();
    out.push_str(&csv_row(&["Course Attendance Report"]));
    out.push_str(&csv_row(&[
        "Generated:",
        &generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
    ]));
    out.push_str(&csv_row(&["Course:", &course.name]));
    out.push_str(&csv_row(&["Code:", &course.code]));
    out.push('\n');

    out.push_str(&csv_row(&["Total Students:", &total_students.to_string()]));
    out.push_str(&csv_row(&["Class Days:", &days_held.to_string()]));
    out.push_str(&csv_row(&["Total Attendance:", &records.len().to_string()]));
    out.push_str(&csv_row(&["Average Attendance Rate:", &format!("{}%", rate)]));
    out.push('\n');

    out.push_str(&csv_row(&["Student Performance"]));
    out.push_str(&csv_row(&["Student Name", "Attendance Count"]));
    for entry in student_performance(records) {
        out.push_str(&csv_row(&[
            &entry.student_name,
            &entry.attendance_count.to_string(),
        ]));
    }
    out.push('\n');

    out.push_str(&csv_row(&["Detailed Attendance Records"]));
    out.push_str(&csv_row(&["Date", "Time", "Student", "Email", "Status"]));
    for record in records {
        out.push_str(&csv_row(&[
            &record.marked_on.to_string(),
            &record.marked_at.format("%H:%M:%S").to_string(),
            &record.student_name,
            &record.student_email,
            record.status.as_str(),
        ]));
    }
    out
}

/// Every attendance row in the system, one flat table.
pub fn attendance_export_csv(records: &[AttendanceRecord]) -> String {
    let mut out = csv_row(&[
        "Date", "Time", "Student", "Email", "Course", "Code", "Status",
    ]);
    for record in records {
        out.push_str(&csv_row(&[
            &record.marked_on.to_string(),
            &record.marked_at.format("%H:%M:%S").to_string(),
            &record.student_name,
            &record.student_email,
            &record.course_name,
            &record.course_code,
            record.status.as_str(),
        ]));
    }
    out
}

fn csv_response(body: String, filename: &str) -> Result<Response, Error> {
    Response::builder()
        .header(header::CONTENT_TYPE, "text/csv")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", filename),
        )
        .body(boxed(Full::new(Bytes::from(body))))
        .map_err(|err| Error::InternalError {
            kind: "HTTPError",
            message: err.to_string(),
        })
}

/// CSV download of a course's attendance, owning lecturer or admin.
pub async fn course_report(
    Path(course_id): Path<Uuid>,
    Query(q): Query<AnalyticsQuery>,
    Extension(pg): Extension<PgPool>,
) -> Result<Response, Error> {
    let caller = authenticate(&q.ssid, &pg).await?;
    let course = course_for_caller(&pg, &caller, course_id).await?;

    let window = q.window();
    let now = Utc::now();
    let records = course_records_since(&pg, course.id, now - Duration::days(window)).await?;
    let (total_students,) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM enrollments WHERE course_id = $1",
    )
    .bind(course.id)
    .fetch_one(&pg)
    .await
    .map_err(Error::from)?;

    let body = course_report_csv(&course, total_students, &records, now);
    let filename = format!("course_report_{}.csv", course.code.replace(' ', "_"));
    csv_response(body, &filename)
}

/// Admin-only export of the whole attendance table.
pub async fn export_attendance(
    Query(q): Query<AnalyticsQuery>,
    Extension(pg): Extension<PgPool>,
) -> Result<Response, Error> {
    let caller = authenticate(&q.ssid, &pg).await?;
    caller.ensure_role(Role::Admin)?;

    let records = sqlx::query_as::<_, AttendanceRecord>(
        "SELECT * FROM attendance ORDER BY marked_at DESC",
    )
    .fetch_all(&pg)
    .await
    .map_err(Error::from)?;

    csv_response(attendance_export_csv(&records), "attendance_export.csv")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttendanceStatus;
    use chrono::TimeZone;

    fn record_on(
        student: Uuid,
        name: &str,
        course: Uuid,
        year: i32,
        month: u32,
        day: u32,
    ) -> AttendanceRecord {
        let marked_on = NaiveDate::from_ymd_opt(year, month, day).unwrap();
        AttendanceRecord {
            id: Uuid::new_v4(),
            student_id: student,
            student_name: name.to_string(),
            student_email: format!("{}@student.edu", name.to_lowercase()),
            course_id: course,
            course_name: "Intro to Databases".to_string(),
            course_code: "CS204".to_string(),
            marked_on,
            status: AttendanceStatus::Present,
            marked_at: Utc
                .from_utc_datetime(&marked_on.and_hms_opt(9, 0, 0).unwrap()),
            session_token: String::new(),
        }
    }

    #[test]
    fn daily_trends_count_per_day_ascending() {
        let s = Uuid::new_v4();
        let c = Uuid::new_v4();
        let records = vec![
            record_on(s, "Ann", c, 2024, 3, 5),
            record_on(Uuid::new_v4(), "Ben", c, 2024, 3, 5),
            record_on(s, "Ann", c, 2024, 3, 4),
        ];

        let days = daily_trends(&records);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(days[0].count, 1);
        assert_eq!(days[1].count, 2);
    }

    #[test]
    fn weeks_bucket_on_mondays() {
        let s = Uuid::new_v4();
        let c = Uuid::new_v4();
        // 2024-03-06 is a Wednesday, 2024-03-11 the following Monday
        let records = vec![
            record_on(s, "Ann", c, 2024, 3, 6),
            record_on(s, "Ann", c, 2024, 3, 8),
            record_on(s, "Ann", c, 2024, 3, 11),
        ];

        let weeks = weekly_breakdown(&records);
        assert_eq!(weeks.len(), 2);
        assert_eq!(
            weeks[0].week_start,
            NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
        );
        assert_eq!(weeks[0].count, 2);
        assert_eq!(
            weeks[1].week_start,
            NaiveDate::from_ymd_opt(2024, 3, 11).unwrap()
        );
        assert_eq!(weeks[1].count, 1);
    }

    #[test]
    fn trend_reflects_halves_of_the_window() {
        let s = Uuid::new_v4();
        let c = Uuid::new_v4();
        let now = Utc
            .from_utc_datetime(
                &NaiveDate::from_ymd_opt(2024, 3, 30)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap(),
            );

        // all activity in the later half
        let rising = vec![
            record_on(s, "Ann", c, 2024, 3, 26),
            record_on(s, "Ann", c, 2024, 3, 27),
            record_on(s, "Ann", c, 2024, 3, 28),
        ];
        assert_eq!(trend(&rising, now, 30), Trend::Increasing);

        // all activity in the earlier half
        let falling = vec![
            record_on(s, "Ann", c, 2024, 3, 2),
            record_on(s, "Ann", c, 2024, 3, 3),
            record_on(s, "Ann", c, 2024, 3, 4),
        ];
        assert_eq!(trend(&falling, now, 30), Trend::Decreasing);

        // one on each side
        let even = vec![
            record_on(s, "Ann", c, 2024, 3, 2),
            record_on(s, "Ann", c, 2024, 3, 28),
        ];
        assert_eq!(trend(&even, now, 30), Trend::Stable);

        assert_eq!(trend(&[], now, 30), Trend::Stable);
    }

    #[test]
    fn rate_handles_empty_courses() {
        assert_eq!(attendance_rate(0, 0, 0), 0);
        assert_eq!(attendance_rate(0, 5, 10), 0);
        assert_eq!(attendance_rate(50, 5, 10), 100);
        assert_eq!(attendance_rate(25, 5, 10), 50);
    }

    #[test]
    fn performance_ranks_best_attenders_first() {
        let ann = Uuid::new_v4();
        let ben = Uuid::new_v4();
        let c = Uuid::new_v4();
        let records = vec![
            record_on(ben, "Ben", c, 2024, 3, 4),
            record_on(ann, "Ann", c, 2024, 3, 4),
            record_on(ann, "Ann", c, 2024, 3, 5),
        ];

        let ranked = student_performance(&records);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].student_name, "Ann");
        assert_eq!(ranked[0].attendance_count, 2);
        assert_eq!(ranked[1].student_name, "Ben");
    }

    #[test]
    fn csv_fields_are_quoted_when_needed() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("has,comma"), "\"has,comma\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_row(&["a", "b,c"]), "a,\"b,c\"\n");
    }

    #[test]
    fn course_report_includes_summary_and_rows() {
        let lecturer = Uuid::new_v4();
        let course = Course {
            id: Uuid::new_v4(),
            name: "Intro, with comma".to_string(),
            code: "CS204".to_string(),
            description: String::new(),
            lecturer_id: lecturer,
            created_at: Utc::now(),
        };
        let s = Uuid::new_v4();
        let records = vec![
            record_on(s, "Ann", course.id, 2024, 3, 4),
            record_on(s, "Ann", course.id, 2024, 3, 5),
        ];

        let csv = course_report_csv(&course, 4, &records, Utc::now());
        assert!(csv.starts_with("Course Attendance Report\n"));
        assert!(csv.contains("Course:,\"Intro, with comma\"\n"));
        assert!(csv.contains("Total Students:,4\n"));
        assert!(csv.contains("Class Days:,2\n"));
        // 2 check-ins over 2 days * 4 students = 25%
        assert!(csv.contains("Average Attendance Rate:,25%\n"));
        assert!(csv.contains("Ann,2\n"));
        assert!(csv.contains("2024-03-04,09:00:00,Ann,ann@student.edu,present\n"));
    }

    #[test]
    fn export_lists_every_row_under_one_header() {
        let s = Uuid::new_v4();
        let c = Uuid::new_v4();
        let records = vec![
            record_on(s, "Ann", c, 2024, 3, 4),
            record_on(s, "Ann", c, 2024, 3, 5),
        ];

        let csv = attendance_export_csv(&records);
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.starts_with("Date,Time,Student,Email,Course,Code,Status\n"));
        assert!(csv.contains(",Intro to Databases,CS204,present\n"));
    }
}
