use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{Decode, Encode, Postgres, Type};
use uuid::Uuid;

use crate::err::Error;

/// Closed role variant. Stored as lowercase text; never compared as strings
/// outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Lecturer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Lecturer => "lecturer",
            Role::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "student" => Some(Role::Student),
            "lecturer" => Some(Role::Lecturer),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// Students and admins are approved at creation; lecturers wait for an
    /// admin to flip the flag.
    pub fn auto_approved(&self) -> bool {
        !matches!(self, Role::Lecturer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
        }
    }

    pub fn parse(raw: &str) -> Option<AttendanceStatus> {
        match raw {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            _ => None,
        }
    }
}

macro_rules! text_backed {
    ($ty:ident) => {
        impl Type<Postgres> for $ty {
            fn type_info() -> PgTypeInfo {
                <String as Type<Postgres>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <String as Type<Postgres>>::compatible(ty)
            }
        }

        impl<'r> Decode<'r, Postgres> for $ty {
            fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as Decode<Postgres>>::decode(value)?;
                $ty::parse(raw)
                    .ok_or_else(|| format!("unknown {}: {}", stringify!($ty), raw).into())
            }
        }

        impl<'q> Encode<'q, Postgres> for $ty {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> IsNull {
                <&str as Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

text_backed!(Role);
text_backed!(AttendanceStatus);

/// The credential row stands in for the managed identity provider: it can
/// exist without a profile (the sign-up inconsistency window), and admin
/// rejection deletes both together.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Credential {
    pub uid: Uuid,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserProfile {
    pub uid: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub picture_url: Option<String>,
}

impl UserProfile {
    /// The approval gate: an unapproved lecturer never gets past sign-in.
    pub fn ensure_approved(&self) -> Result<(), Error> {
        if self.role == Role::Lecturer && !self.approved {
            return Err(Error::PendingApproval {
                message: "Your lecturer account is pending admin approval. Please contact an administrator.".to_string(),
            });
        }
        Ok(())
    }

    pub fn ensure_role(&self, role: Role) -> Result<(), Error> {
        if self.role != role {
            return Err(Error::Unauthorized {
                message: format!("This action requires the {} role", role.as_str()),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSession {
    pub ssid: String,
    pub expires_at: DateTime<Utc>,
    pub belongs_to: Uuid,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Course {
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub description: String,
    pub lecturer_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CourseMaterial {
    pub course_id: Uuid,
    pub url: String,
    pub filename: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Enrollment {
    pub student_id: Uuid,
    pub course_id: Uuid,
    pub enrolled_at: DateTime<Utc>,
    pub enrolled_by: Uuid,
}

/// Append-only attendance row. Student and course display fields are
/// denormalized at write time so history listings need no joins.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub student_name: String,
    pub student_email: String,
    pub course_id: Uuid,
    pub course_name: String,
    pub course_code: String,
    pub marked_on: NaiveDate,
    pub status: AttendanceStatus,
    pub marked_at: DateTime<Utc>,
    pub session_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_round_trip_through_text() {
        for role in [Role::Student, Role::Lecturer, Role::Admin] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn only_lecturers_wait_for_approval() {
        assert!(Role::Student.auto_approved());
        assert!(Role::Admin.auto_approved());
        assert!(!Role::Lecturer.auto_approved());
    }

    #[test]
    fn approval_gate_blocks_unapproved_lecturer() {
        let mut profile = sample_profile(Role::Lecturer, false);
        assert!(matches!(
            profile.ensure_approved(),
            Err(Error::PendingApproval { .. })
        ));

        profile.approved = true;
        assert!(profile.ensure_approved().is_ok());

        let student = sample_profile(Role::Student, true);
        assert!(student.ensure_approved().is_ok());
    }

    #[test]
    fn role_check_rejects_other_roles() {
        let student = sample_profile(Role::Student, true);
        assert!(student.ensure_role(Role::Student).is_ok());
        assert!(matches!(
            student.ensure_role(Role::Admin),
            Err(Error::Unauthorized { .. })
        ));
    }

    fn sample_profile(role: Role, approved: bool) -> UserProfile {
        UserProfile {
            uid: Uuid::new_v4(),
            email: "someone@example.edu".to_string(),
            name: "Someone".to_string(),
            role,
            approved,
            created_at: Utc::now(),
            approved_at: None,
            picture_url: None,
        }
    }
}
