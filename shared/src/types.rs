use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type FamilyId = i64;
pub type RecordId = i64;

// ========== USER ==========
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct User {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct UpsertUserRequest {
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

/// Authenticated caller as handed over by the identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            display_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

// ========== ORGANIZATION ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrgType {
    Charter,
    StateProgram,
    CoOp,
    Private,
    Other,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Organization {
    pub id: i64,
    pub name: String,
    pub org_type: OrgType,
    pub requires_teacher_oversight: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    pub org_type: OrgType,
    #[serde(default)]
    pub requires_teacher_oversight: bool,
}

// ========== FAMILY ==========
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Family {
    pub id: FamilyId,
    pub name: String,
    pub organization_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /families`. A blank name falls back to the caller's profile.
#[derive(Debug, Default, Deserialize)]
pub struct CreateFamilyRequest {
    #[serde(default)]
    pub name: String,
    pub organization_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Parent,
    Teacher,
    Admin,
}

impl Role {
    /// Parents and admins may create, change and delete family records.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Parent | Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "parent" => Some(Role::Parent),
            "teacher" => Some(Role::Teacher),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FamilyMembership {
    pub id: i64,
    pub user_id: String,
    pub family_id: FamilyId,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

// ========== INVITATION ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Expired,
}

impl InvitationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(InvitationStatus::Pending),
            "accepted" => Some(InvitationStatus::Accepted),
            "expired" => Some(InvitationStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Invitation {
    pub id: Uuid,
    pub email: String,
    pub family_id: FamilyId,
    pub invited_by: String,
    pub role: Role,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub resent_at: Option<DateTime<Utc>>,
}

impl Invitation {
    /// A fresh pending teacher invitation.
    pub fn new(email: String, family_id: FamilyId, invited_by: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email,
            family_id,
            invited_by,
            role: Role::Teacher,
            status: InvitationStatus::Pending,
            created_at: now,
            accepted_at: None,
            resent_at: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateInviteRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct InviteResponse {
    pub invite_id: Uuid,
    pub email: String,
    pub family_id: FamilyId,
    pub family_name: String,
    pub status: InvitationStatus,
    pub expires_at: DateTime<Utc>,
}

// ========== RESOURCES ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Student,
    Curriculum,
    Assignment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Student,
        ResourceKind::Curriculum,
        ResourceKind::Assignment,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Student => "student",
            ResourceKind::Curriculum => "curriculum",
            ResourceKind::Assignment => "assignment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "student" => Some(ResourceKind::Student),
            "curriculum" => Some(ResourceKind::Curriculum),
            "assignment" => Some(ResourceKind::Assignment),
            _ => None,
        }
    }
}

/// Storage form of a student, curriculum or assignment.
///
/// `owner_id` and `family_id` are the columns access control filters on;
/// `data` carries the full serialized record.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRow {
    pub kind: ResourceKind,
    pub id: RecordId,
    pub owner_id: String,
    pub family_id: Option<FamilyId>,
    pub data: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GradeLevel {
    #[serde(rename = "PREK")]
    PreK,
    #[serde(rename = "K")]
    Kindergarten,
    G01,
    G02,
    G03,
    G04,
    G05,
    G06,
    G07,
    G08,
    G09,
    G10,
    G11,
    G12,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Student {
    #[serde(default)]
    pub id: RecordId,
    pub owner_id: String,
    pub family_id: Option<FamilyId>,
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub grade_level: GradeLevel,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    pub fn full_name(&self) -> String {
        if self.last_name.is_empty() {
            self.first_name.clone()
        } else {
            format!("{} {}", self.first_name, self.last_name)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StudentRequest {
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub grade_level: GradeLevel,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Curriculum {
    #[serde(default)]
    pub id: RecordId,
    pub owner_id: String,
    pub family_id: Option<FamilyId>,
    pub name: String,
    pub subject: String,
    pub grade_level: Option<GradeLevel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CurriculumRequest {
    pub name: String,
    pub subject: String,
    pub grade_level: Option<GradeLevel>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    InProgress,
    Submitted,
    Complete,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentSource {
    Parent,
    Teacher,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Assignment {
    #[serde(default)]
    pub id: RecordId,
    pub owner_id: String,
    pub family_id: Option<FamilyId>,
    pub student_id: RecordId,
    pub curriculum_id: RecordId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub due_date: NaiveDate,
    pub status: AssignmentStatus,
    pub source: AssignmentSource,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Assignment {
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.due_date < today && self.status != AssignmentStatus::Complete
    }
}

#[derive(Debug, Deserialize)]
pub struct AssignmentRequest {
    pub student_id: RecordId,
    pub curriculum_id: RecordId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub due_date: NaiveDate,
    pub status: Option<AssignmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: AssignmentStatus,
}

// ========== RESOURCE LINK ==========
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    /// Quiz or test the student takes.
    Assessment,
    #[default]
    Resource,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Assessment => "assessment",
            LinkType::Resource => "resource",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "assessment" => Some(LinkType::Assessment),
            "resource" => Some(LinkType::Resource),
            _ => None,
        }
    }
}

/// External link attached to an assignment. Removed with its assignment.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceLink {
    pub id: RecordId,
    pub assignment_id: RecordId,
    pub url: String,
    pub label: String,
    pub link_type: LinkType,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ResourceLink {
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.url
        } else {
            &self.label
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResourceLinkRequest {
    pub url: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub link_type: LinkType,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}
