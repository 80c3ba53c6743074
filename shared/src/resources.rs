//! Students, curricula and assignments behind the family permission rules.
//!
//! Lists use the selected family's scoped set, detail pages the viewable set,
//! and changes the editable set. Anything outside the relevant set is
//! reported as not found.

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::families::active_family_for;
use crate::permissions::{user_can_edit, Access, Owned, RecordFilter};
use crate::selector::{get_selected_family, RequestContext};
use crate::store::StoreError;
use crate::types::{
    Assignment, AssignmentRequest, AssignmentSource, AssignmentStatus, Curriculum,
    CurriculumRequest, Family, FamilyId, LinkType, RecordId, ResourceKind, ResourceLink,
    ResourceLinkRequest, ResourceRow, Role, Student, StudentRequest,
};
use crate::AppState;

pub const STUDENT_LINK_SALT: &str = "student-status-update";

/// A record type stored as a [`ResourceRow`].
pub trait Resource: Owned + Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: ResourceKind;

    fn id(&self) -> RecordId;

    /// Copies the storage columns over whatever the serialized body carried.
    fn set_columns(&mut self, id: RecordId, owner_id: String, family_id: Option<FamilyId>);
}

macro_rules! impl_resource {
    ($($ty:ty => $kind:expr),*) => {
        $(impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn id(&self) -> RecordId {
                self.id
            }

            fn set_columns(&mut self, id: RecordId, owner_id: String, family_id: Option<FamilyId>) {
                self.id = id;
                self.owner_id = owner_id;
                self.family_id = family_id;
            }
        })*
    };
}

impl_resource!(
    Student => ResourceKind::Student,
    Curriculum => ResourceKind::Curriculum,
    Assignment => ResourceKind::Assignment
);

fn codec_error(action: &str, kind: ResourceKind, err: serde_json::Error) -> AppError {
    AppError::Store(StoreError::Unexpected(anyhow::anyhow!(
        "{action} {}: {err}",
        kind.as_str()
    )))
}

pub fn to_row<R: Resource>(record: &R) -> AppResult<ResourceRow> {
    let data = serde_json::to_value(record).map_err(|e| codec_error("encode", R::KIND, e))?;
    Ok(ResourceRow {
        kind: R::KIND,
        id: record.id(),
        owner_id: record.owner_id().to_string(),
        family_id: record.family_id(),
        data,
    })
}

pub fn from_row<R: Resource>(row: ResourceRow) -> AppResult<R> {
    let mut record: R =
        serde_json::from_value(row.data).map_err(|e| codec_error("decode", R::KIND, e))?;
    record.set_columns(row.id, row.owner_id, row.family_id);
    Ok(record)
}

fn decode_all<R: Resource>(rows: Vec<ResourceRow>) -> AppResult<Vec<R>> {
    rows.into_iter().map(from_row).collect()
}

/// The record if it exists and falls inside `filter`.
async fn find_in<R: Resource>(state: &AppState, filter: &RecordFilter, id: RecordId) -> AppResult<R> {
    match state.store.get_record(R::KIND, id).await? {
        Some(row) if filter.matches(&row) => from_row(row),
        _ => Err(AppError::NotFound),
    }
}

async fn insert<R: Resource>(state: &AppState, record: R) -> AppResult<R> {
    let row = state.store.insert_record(to_row(&record)?).await?;
    from_row(row)
}

async fn save<R: Resource>(state: &AppState, record: &R) -> AppResult<()> {
    state.store.update_record(&to_row(record)?).await?;
    Ok(())
}

fn required(field: &'static str, value: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::validation(field, "This field is required."));
    }
    Ok(value.to_string())
}

/// Records of the selected family (plus legacy rows for editors).
pub async fn list_records<R: Resource>(
    state: &AppState,
    ctx: &mut RequestContext,
) -> AppResult<Vec<R>> {
    let store = state.store.as_ref();
    let family = get_selected_family(store, ctx).await?;
    let filter = RecordFilter::scoped(ctx.access(store).await?, family.map(|f| f.id));
    decode_all(store.list_records(R::KIND, &filter).await?)
}

pub async fn get_record<R: Resource>(state: &AppState, access: &Access, id: RecordId) -> AppResult<R> {
    find_in(state, &RecordFilter::viewable(access), id).await
}

/// Deletes from the editable set. Students and curricula still referenced by
/// an assignment are kept.
pub async fn delete_record<R: Resource>(
    state: &AppState,
    access: &Access,
    id: RecordId,
) -> AppResult<()> {
    let record: R = find_in(state, &RecordFilter::editable(access), id).await?;

    if R::KIND != ResourceKind::Assignment {
        let neighbourhood = RecordFilter::new(
            record.family_id().into_iter().collect(),
            Some(record.owner_id().to_string()),
        );
        let rows = state
            .store
            .list_records(ResourceKind::Assignment, &neighbourhood)
            .await?;
        let in_use = decode_all::<Assignment>(rows)?.iter().any(|a| match R::KIND {
            ResourceKind::Student => a.student_id == id,
            ResourceKind::Curriculum => a.curriculum_id == id,
            ResourceKind::Assignment => false,
        });
        if in_use {
            return Err(AppError::Validation {
                field: None,
                message: format!(
                    "This {} still has assignments and cannot be deleted.",
                    R::KIND.as_str()
                ),
            });
        }
    }

    state.store.delete_record(R::KIND, id).await?;
    tracing::info!("User {} deleted {} {}", access.user_id(), R::KIND.as_str(), id);
    Ok(())
}

/// Owner and family stamped on records a parent or admin creates.
async fn editor_columns(state: &AppState, access: &Access) -> AppResult<(String, Option<FamilyId>)> {
    if !user_can_edit(access) {
        return Err(AppError::NotFound);
    }
    let family = active_family_for(state.store.as_ref(), access).await?;
    Ok((access.user_id().to_string(), family.map(|f| f.id)))
}

// ========== STUDENTS ==========

pub async fn create_student(
    state: &AppState,
    access: &Access,
    req: StudentRequest,
    now: DateTime<Utc>,
) -> AppResult<Student> {
    let (owner_id, family_id) = editor_columns(state, access).await?;
    let student = Student {
        id: 0,
        owner_id,
        family_id,
        first_name: required("first_name", &req.first_name)?,
        last_name: req.last_name.trim().to_string(),
        date_of_birth: req.date_of_birth,
        grade_level: req.grade_level,
        created_at: now,
        updated_at: now,
    };
    let student = insert(state, student).await?;
    tracing::info!("Student {} added by {}", student.id, access.user_id());
    Ok(student)
}

pub async fn update_student(
    state: &AppState,
    access: &Access,
    id: RecordId,
    req: StudentRequest,
    now: DateTime<Utc>,
) -> AppResult<Student> {
    let mut student: Student = find_in(state, &RecordFilter::editable(access), id).await?;
    student.first_name = required("first_name", &req.first_name)?;
    student.last_name = req.last_name.trim().to_string();
    student.date_of_birth = req.date_of_birth;
    student.grade_level = req.grade_level;
    student.updated_at = now;
    save(state, &student).await?;
    Ok(student)
}

// ========== CURRICULA ==========

pub async fn create_curriculum(
    state: &AppState,
    access: &Access,
    req: CurriculumRequest,
    now: DateTime<Utc>,
) -> AppResult<Curriculum> {
    let (owner_id, family_id) = editor_columns(state, access).await?;
    let curriculum = Curriculum {
        id: 0,
        owner_id,
        family_id,
        name: required("name", &req.name)?,
        subject: required("subject", &req.subject)?,
        grade_level: req.grade_level,
        created_at: now,
        updated_at: now,
    };
    let curriculum = insert(state, curriculum).await?;
    tracing::info!("Curriculum {} created by {}", curriculum.id, access.user_id());
    Ok(curriculum)
}

pub async fn update_curriculum(
    state: &AppState,
    access: &Access,
    id: RecordId,
    req: CurriculumRequest,
    now: DateTime<Utc>,
) -> AppResult<Curriculum> {
    let mut curriculum: Curriculum = find_in(state, &RecordFilter::editable(access), id).await?;
    curriculum.name = required("name", &req.name)?;
    curriculum.subject = required("subject", &req.subject)?;
    curriculum.grade_level = req.grade_level;
    curriculum.updated_at = now;
    save(state, &curriculum).await?;
    Ok(curriculum)
}

// ========== ASSIGNMENTS ==========

/// Parents and admins may change any assignment they can edit. Teachers may
/// change only the teacher assignments they created themselves.
pub fn can_edit_assignment(access: &Access, assignment: &Assignment) -> bool {
    if user_can_edit(access) {
        return RecordFilter::editable(access).matches(assignment);
    }
    assignment.source == AssignmentSource::Teacher
        && assignment.created_by == access.user_id()
        && RecordFilter::viewable(access).matches(assignment)
}

/// Students and curricula an assignment written by this user may point at.
fn reference_scope(access: &Access, family: Option<&Family>) -> RecordFilter {
    if user_can_edit(access) {
        return RecordFilter::editable(access);
    }
    match family {
        Some(family) => RecordFilter::scoped(access, Some(family.id)),
        None => RecordFilter::default(),
    }
}

async fn check_references(
    state: &AppState,
    scope: &RecordFilter,
    student_id: RecordId,
    curriculum_id: RecordId,
) -> AppResult<()> {
    let student = state.store.get_record(ResourceKind::Student, student_id).await?;
    if !student.is_some_and(|row| scope.matches(&row)) {
        return Err(AppError::validation("student_id", "Invalid student selection."));
    }
    let curriculum = state
        .store
        .get_record(ResourceKind::Curriculum, curriculum_id)
        .await?;
    if !curriculum.is_some_and(|row| scope.matches(&row)) {
        return Err(AppError::validation(
            "curriculum_id",
            "Invalid curriculum selection.",
        ));
    }
    Ok(())
}

/// Scoped assignments ordered by due date, then title.
pub async fn list_assignments(
    state: &AppState,
    ctx: &mut RequestContext,
) -> AppResult<Vec<Assignment>> {
    let mut assignments: Vec<Assignment> = list_records(state, ctx).await?;
    assignments.sort_by(|a, b| (a.due_date, &a.title).cmp(&(b.due_date, &b.title)));
    Ok(assignments)
}

/// Parents and admins create assignments for their active family. Teachers
/// need a selected family; their assignments belong to its first parent.
pub async fn create_assignment(
    state: &AppState,
    ctx: &mut RequestContext,
    req: AssignmentRequest,
    now: DateTime<Utc>,
) -> AppResult<Assignment> {
    let store = state.store.as_ref();
    let selected = get_selected_family(store, ctx).await?;
    let access = ctx.access(store).await?.clone();
    let is_editor = user_can_edit(&access);
    if !is_editor && selected.is_none() {
        return Err(AppError::NotFound);
    }

    let title = required("title", &req.title)?;
    if req.due_date < now.date_naive() {
        return Err(AppError::validation("due_date", "Due date cannot be in the past."));
    }
    check_references(
        state,
        &reference_scope(&access, selected.as_ref()),
        req.student_id,
        req.curriculum_id,
    )
    .await?;

    let (owner_id, family_id, source) = match selected {
        _ if is_editor => (
            access.user_id().to_string(),
            active_family_for(store, &access).await?.map(|f| f.id),
            AssignmentSource::Parent,
        ),
        Some(family) => {
            let parent = store
                .memberships_for_family(family.id)
                .await?
                .into_iter()
                .find(|m| m.role == Role::Parent)
                .ok_or(AppError::NotFound)?;
            (parent.user_id, Some(family.id), AssignmentSource::Teacher)
        }
        None => return Err(AppError::NotFound),
    };

    let assignment = Assignment {
        id: 0,
        owner_id,
        family_id,
        student_id: req.student_id,
        curriculum_id: req.curriculum_id,
        title,
        description: req.description.trim().to_string(),
        due_date: req.due_date,
        status: req.status.unwrap_or(AssignmentStatus::Pending),
        source,
        created_by: access.user_id().to_string(),
        created_at: now,
        updated_at: now,
    };
    let assignment = insert(state, assignment).await?;
    tracing::info!(
        "Assignment {} created by {} ({:?})",
        assignment.id,
        access.user_id(),
        assignment.source
    );
    Ok(assignment)
}

pub async fn update_assignment(
    state: &AppState,
    ctx: &mut RequestContext,
    id: RecordId,
    req: AssignmentRequest,
    now: DateTime<Utc>,
) -> AppResult<Assignment> {
    let store = state.store.as_ref();
    let selected = get_selected_family(store, ctx).await?;
    let access = ctx.access(store).await?.clone();

    let mut assignment: Assignment = find_in(state, &RecordFilter::viewable(&access), id).await?;
    if !can_edit_assignment(&access, &assignment) {
        return Err(AppError::NotFound);
    }
    check_references(
        state,
        &reference_scope(&access, selected.as_ref()),
        req.student_id,
        req.curriculum_id,
    )
    .await?;

    assignment.student_id = req.student_id;
    assignment.curriculum_id = req.curriculum_id;
    assignment.title = required("title", &req.title)?;
    assignment.description = req.description.trim().to_string();
    assignment.due_date = req.due_date;
    if let Some(status) = req.status {
        assignment.status = status;
    }
    assignment.updated_at = now;
    save(state, &assignment).await?;
    Ok(assignment)
}

/// An assignment as its detail page shows it.
#[derive(Debug, Serialize)]
pub struct AssignmentDetail {
    #[serde(flatten)]
    pub assignment: Assignment,
    pub can_edit: bool,
    pub can_delete: bool,
    pub assessment_links: Vec<ResourceLink>,
    pub resource_links: Vec<ResourceLink>,
}

pub async fn assignment_detail(
    state: &AppState,
    access: &Access,
    id: RecordId,
) -> AppResult<AssignmentDetail> {
    let assignment: Assignment = find_in(state, &RecordFilter::viewable(access), id).await?;
    let (assessment_links, resource_links) = links_by_type(state, assignment.id).await?;
    Ok(AssignmentDetail {
        can_edit: can_edit_assignment(access, &assignment),
        can_delete: user_can_edit(access),
        assignment,
        assessment_links,
        resource_links,
    })
}

// ========== RESOURCE LINKS ==========

const MAX_LABEL_CHARS: usize = 200;

async fn links_by_type(
    state: &AppState,
    assignment_id: RecordId,
) -> AppResult<(Vec<ResourceLink>, Vec<ResourceLink>)> {
    Ok(state
        .store
        .resource_links_for(assignment_id)
        .await?
        .into_iter()
        .partition(|link| link.link_type == LinkType::Assessment))
}

fn check_link_url(raw: &str) -> AppResult<String> {
    let url = required("url", raw)?;
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(AppError::validation("url", "Enter a valid URL."));
    };
    if !scheme.eq_ignore_ascii_case("http") && !scheme.eq_ignore_ascii_case("https") {
        return Err(AppError::validation(
            "url",
            "Only HTTP and HTTPS URLs are allowed.",
        ));
    }
    if rest.is_empty() {
        return Err(AppError::validation("url", "Enter a valid URL."));
    }
    Ok(url)
}

/// The assignment behind a link change, if this user may change it.
async fn editable_assignment(
    state: &AppState,
    access: &Access,
    id: RecordId,
) -> AppResult<Assignment> {
    let assignment: Assignment = find_in(state, &RecordFilter::viewable(access), id).await?;
    if !can_edit_assignment(access, &assignment) {
        return Err(AppError::NotFound);
    }
    Ok(assignment)
}

pub async fn add_resource_link(
    state: &AppState,
    access: &Access,
    assignment_id: RecordId,
    req: ResourceLinkRequest,
    now: DateTime<Utc>,
) -> AppResult<ResourceLink> {
    let assignment = editable_assignment(state, access, assignment_id).await?;

    let url = check_link_url(&req.url)?;
    let label = req.label.trim().to_string();
    if label.chars().count() > MAX_LABEL_CHARS {
        return Err(AppError::validation(
            "label",
            "Ensure this value has at most 200 characters.",
        ));
    }
    if let (Some(start), Some(end)) = (req.window_start, req.window_end) {
        if end <= start {
            return Err(AppError::validation(
                "window_end",
                "The window must end after it starts.",
            ));
        }
    }

    let link = state
        .store
        .insert_resource_link(ResourceLink {
            id: 0,
            assignment_id: assignment.id,
            url,
            label,
            link_type: req.link_type,
            window_start: req.window_start,
            window_end: req.window_end,
            created_at: now,
        })
        .await?;
    tracing::info!(
        "User {} linked {} to assignment {}",
        access.user_id(),
        link.display_label(),
        assignment.id
    );
    Ok(link)
}

pub async fn delete_resource_link(
    state: &AppState,
    access: &Access,
    assignment_id: RecordId,
    link_id: RecordId,
) -> AppResult<()> {
    let assignment = editable_assignment(state, access, assignment_id).await?;
    state
        .store
        .delete_resource_link(assignment.id, link_id)
        .await?;
    Ok(())
}

// ========== STUDENT STATUS LINKS ==========

#[derive(Debug, Serialize, Deserialize)]
struct StudentLinkPayload {
    assignment_id: RecordId,
}

#[derive(Debug, Serialize)]
pub struct StatusLink {
    pub token: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// What a student sees behind a status link.
#[derive(Debug, Serialize, PartialEq)]
pub struct StudentAssignmentView {
    pub id: RecordId,
    pub title: String,
    pub description: String,
    pub due_date: NaiveDate,
    pub status: AssignmentStatus,
    pub student_name: String,
    pub curriculum_name: String,
    pub is_overdue: bool,
    pub assessment_links: Vec<ResourceLink>,
    pub resource_links: Vec<ResourceLink>,
}

pub async fn student_status_link(
    state: &AppState,
    access: &Access,
    id: RecordId,
    now: DateTime<Utc>,
) -> AppResult<StatusLink> {
    let assignment: Assignment = find_in(state, &RecordFilter::viewable(access), id).await?;
    if !can_edit_assignment(access, &assignment) {
        return Err(AppError::NotFound);
    }

    let payload = StudentLinkPayload {
        assignment_id: assignment.id,
    };
    let token = state
        .signer
        .sign(STUDENT_LINK_SALT, &payload, now)
        .map_err(|e| codec_error("sign link for", ResourceKind::Assignment, e))?;
    let url = format!(
        "{}/status/{}",
        state.config.frontend_url.trim_end_matches('/'),
        token
    );
    Ok(StatusLink {
        token,
        url,
        expires_at: now + state.config.student_link_max_age,
    })
}

async fn assignment_from_token(
    state: &AppState,
    token: &str,
    now: DateTime<Utc>,
) -> AppResult<Assignment> {
    let payload: StudentLinkPayload = state
        .signer
        .unsign(
            STUDENT_LINK_SALT,
            token,
            Some(state.config.student_link_max_age),
            now,
        )
        .map_err(|e| {
            tracing::warn!("Rejected student status link: {}", e);
            AppError::InvalidLink
        })?;

    match state
        .store
        .get_record(ResourceKind::Assignment, payload.assignment_id)
        .await?
    {
        Some(row) => from_row(row),
        None => Err(AppError::InvalidLink),
    }
}

async fn student_view(
    state: &AppState,
    assignment: Assignment,
    today: NaiveDate,
) -> AppResult<StudentAssignmentView> {
    let student_name = match state
        .store
        .get_record(ResourceKind::Student, assignment.student_id)
        .await?
    {
        Some(row) => from_row::<Student>(row)?.full_name(),
        None => String::new(),
    };
    let curriculum_name = match state
        .store
        .get_record(ResourceKind::Curriculum, assignment.curriculum_id)
        .await?
    {
        Some(row) => from_row::<Curriculum>(row)?.name,
        None => String::new(),
    };

    let (assessment_links, resource_links) = links_by_type(state, assignment.id).await?;
    Ok(StudentAssignmentView {
        id: assignment.id,
        is_overdue: assignment.is_overdue(today),
        title: assignment.title,
        description: assignment.description,
        due_date: assignment.due_date,
        status: assignment.status,
        student_name,
        curriculum_name,
        assessment_links,
        resource_links,
    })
}

/// No login: the signed token is the only credential.
pub async fn student_status_view(
    state: &AppState,
    token: &str,
    now: DateTime<Utc>,
) -> AppResult<StudentAssignmentView> {
    let assignment = assignment_from_token(state, token, now).await?;
    student_view(state, assignment, now.date_naive()).await
}

pub async fn student_status_update(
    state: &AppState,
    token: &str,
    status: AssignmentStatus,
    now: DateTime<Utc>,
) -> AppResult<StudentAssignmentView> {
    let mut assignment = assignment_from_token(state, token, now).await?;
    assignment.status = status;
    assignment.updated_at = now;
    save(state, &assignment).await?;
    tracing::info!(
        "Assignment {} set to {:?} through a student link",
        assignment.id,
        status
    );
    student_view(state, assignment, now.date_naive()).await
}
