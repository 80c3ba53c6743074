use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use homeschool_shared::backfill::backfill_families;
use homeschool_shared::config::AppConfig;
use homeschool_shared::email::RecordingMailer;
use homeschool_shared::error::{AppError, InviteRejection};
use homeschool_shared::invitations::{
    accept_invitation, create_invitation, invitation_details, pending_invitations,
    resend_invitation,
};
use homeschool_shared::permissions::{user_can_edit, Access};
use homeschool_shared::resources::{
    add_resource_link, assignment_detail, create_assignment, create_curriculum, create_student,
    delete_record, delete_resource_link, get_record, list_records, student_status_link,
    student_status_update, student_status_view, update_assignment, update_student,
};
use homeschool_shared::selector::{get_selected_family, RequestContext};
use homeschool_shared::session::Session;
use homeschool_shared::store::memory::InMemoryStore;
use homeschool_shared::store::Store;
use homeschool_shared::types::{
    Assignment, AssignmentRequest, AssignmentSource, AssignmentStatus, Curriculum,
    CurriculumRequest, FamilyId, GradeLevel, Identity, InvitationStatus, LinkType,
    ResourceKind, ResourceLinkRequest, ResourceRow, Role, Student, StudentRequest,
};
use homeschool_shared::AppState;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 2, 9, 0, 0).unwrap()
}

fn setup() -> (Arc<AppState>, Arc<RecordingMailer>) {
    let mailer = Arc::new(RecordingMailer::new());
    let state = AppState::new(
        Arc::new(InMemoryStore::new()),
        mailer.clone(),
        AppConfig::local("integration-secret"),
    );
    (state, mailer)
}

async fn family_with(state: &AppState, name: &str, members: &[(&str, Role)]) -> FamilyId {
    let family = state.store.create_family(name, None).await.unwrap();
    for (user_id, role) in members {
        state
            .store
            .add_membership(user_id, family.id, *role)
            .await
            .unwrap();
    }
    family.id
}

fn ctx(user_id: &str, family_param: Option<String>, session: Session) -> RequestContext {
    RequestContext::new(
        Identity::new(user_id).with_email(format!("{user_id}@example.com")),
        family_param,
        session,
    )
}

async fn access(state: &AppState, user_id: &str) -> Access {
    Access::load(state.store.as_ref(), user_id).await.unwrap()
}

fn student_request(first_name: &str) -> StudentRequest {
    StudentRequest {
        first_name: first_name.to_string(),
        last_name: String::new(),
        date_of_birth: None,
        grade_level: GradeLevel::G03,
    }
}

fn legacy_row(owner: &str) -> ResourceRow {
    ResourceRow {
        kind: ResourceKind::Student,
        id: 0,
        owner_id: owner.to_string(),
        family_id: None,
        data: serde_json::json!({
            "owner_id": owner,
            "family_id": null,
            "first_name": "Legacy",
            "date_of_birth": null,
            "grade_level": "G01",
            "created_at": "2023-01-01T00:00:00Z",
            "updated_at": "2023-01-01T00:00:00Z",
        }),
    }
}

#[tokio::test]
async fn membershipless_user_edits_only_own_legacy_records() {
    let (state, _) = setup();
    let solo = access(&state, "solo").await;
    assert!(user_can_edit(&solo));

    let student = create_student(&state, &solo, student_request("Ada"), now())
        .await
        .unwrap();
    assert_eq!(student.family_id, None);
    assert_eq!(student.owner_id, "solo");

    let renamed = update_student(&state, &solo, student.id, student_request("Ava"), now())
        .await
        .unwrap();
    assert_eq!(renamed.first_name, "Ava");

    let other = access(&state, "other").await;
    assert!(matches!(
        get_record::<Student>(&state, &other, student.id).await,
        Err(AppError::NotFound)
    ));
    assert!(matches!(
        update_student(&state, &other, student.id, student_request("Eve"), now()).await,
        Err(AppError::NotFound)
    ));
}

#[tokio::test]
async fn teacher_only_user_cannot_create_students() {
    let (state, _) = setup();
    family_with(&state, "Smith Family", &[("parent", Role::Parent), ("teacher", Role::Teacher)]).await;

    let teacher = access(&state, "teacher").await;
    assert!(!user_can_edit(&teacher));
    assert!(matches!(
        create_student(&state, &teacher, student_request("Ada"), now()).await,
        Err(AppError::NotFound)
    ));
}

#[tokio::test]
async fn co_parents_edit_each_others_family_records() {
    let (state, _) = setup();
    let family_id = family_with(
        &state,
        "Smith Family",
        &[("mom", Role::Parent), ("dad", Role::Parent)],
    )
    .await;

    let mom = access(&state, "mom").await;
    let student = create_student(&state, &mom, student_request("Ada"), now())
        .await
        .unwrap();
    assert_eq!(student.family_id, Some(family_id));

    let dad = access(&state, "dad").await;
    let updated = update_student(&state, &dad, student.id, student_request("Ida"), now())
        .await
        .unwrap();
    assert_eq!(updated.first_name, "Ida");
    assert_eq!(updated.owner_id, "mom");
}

#[tokio::test]
async fn backfill_is_idempotent_and_never_overwrites() {
    let (state, _) = setup();
    let store = state.store.as_ref();
    let tagged_elsewhere = family_with(&state, "Other Family", &[]).await;

    let legacy = store.insert_record(legacy_row("owner")).await.unwrap();
    let mut pre_tagged = legacy_row("owner");
    pre_tagged.family_id = Some(tagged_elsewhere);
    let pre_tagged = store.insert_record(pre_tagged).await.unwrap();

    let first = backfill_families(store).await.unwrap();
    assert_eq!(first.families_created, 1);
    assert_eq!(first.records_updated, 1);

    let memberships = store.memberships_for_user("owner").await.unwrap();
    assert_eq!(memberships.len(), 1);
    assert_eq!(memberships[0].role, Role::Parent);
    let family_id = memberships[0].family_id;

    let second = backfill_families(store).await.unwrap();
    assert_eq!(second.families_created, 0);
    assert_eq!(second.records_updated, 0);
    assert_eq!(store.memberships_for_user("owner").await.unwrap(), memberships);

    let legacy = store
        .get_record(ResourceKind::Student, legacy.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(legacy.family_id, Some(family_id));
    let pre_tagged = store
        .get_record(ResourceKind::Student, pre_tagged.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pre_tagged.family_id, Some(tagged_elsewhere));
}

#[tokio::test]
async fn second_pending_invitation_is_rejected() {
    let (state, mailer) = setup();
    family_with(&state, "Smith Family", &[("parent", Role::Parent)]).await;
    let parent = Identity::new("parent");

    let first = create_invitation(&state, &parent, "Teacher@Example.com", now())
        .await
        .unwrap();
    assert_eq!(first.status, InvitationStatus::Pending);
    assert_eq!(mailer.sent().await.len(), 1);

    let second = create_invitation(&state, &parent, "teacher@example.com ", now()).await;
    assert!(matches!(
        second,
        Err(AppError::Validation { field: Some("email"), .. })
    ));
    assert_eq!(mailer.sent().await.len(), 1);
}

#[tokio::test]
async fn stale_invitation_expires_and_cannot_be_accepted() {
    let (state, _) = setup();
    let family_id = family_with(&state, "Smith Family", &[("parent", Role::Parent)]).await;
    let parent = Identity::new("parent");
    let created_at = now() - Duration::days(8);

    let invite = create_invitation(&state, &parent, "teacher@example.com", created_at)
        .await
        .unwrap();

    let details = invitation_details(&state, invite.invite_id, now()).await.unwrap();
    assert_eq!(details.status, InvitationStatus::Expired);

    let teacher = Identity::new("teacher").with_email("teacher@example.com");
    assert!(matches!(
        accept_invitation(&state, &teacher, invite.invite_id, now()).await,
        Err(AppError::Invitation(InviteRejection::Expired))
    ));
    assert!(matches!(
        resend_invitation(&state, &parent, invite.invite_id, now()).await,
        Err(AppError::Invitation(InviteRejection::ResendExpired))
    ));
    assert!(state
        .store
        .get_membership("teacher", family_id)
        .await
        .unwrap()
        .is_none());

    // The expired invitation no longer blocks a fresh one.
    create_invitation(&state, &parent, "teacher@example.com", now())
        .await
        .unwrap();
}

#[tokio::test]
async fn accepted_invitation_grants_teacher_membership_once() {
    let (state, _) = setup();
    let family_id = family_with(&state, "Smith Family", &[("parent", Role::Parent)]).await;
    let parent = Identity::new("parent");
    let invite = create_invitation(&state, &parent, "teacher@example.com", now())
        .await
        .unwrap();
    assert_eq!(pending_invitations(&state, &parent, now()).await.unwrap().len(), 1);

    let teacher = Identity::new("teacher").with_email("teacher@example.com");
    let accepted = accept_invitation(&state, &teacher, invite.invite_id, now())
        .await
        .unwrap();
    assert_eq!(accepted.family.id, family_id);
    assert_eq!(accepted.role, Role::Teacher);
    assert_eq!(
        accepted.message,
        "Welcome! You've joined Smith Family as a teacher."
    );

    assert!(matches!(
        accept_invitation(&state, &teacher, invite.invite_id, now()).await,
        Err(AppError::Invitation(InviteRejection::AlreadyAccepted))
    ));
    assert!(pending_invitations(&state, &parent, now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn request_parameter_overrides_session_family() {
    let (state, _) = setup();
    let stored = family_with(&state, "Stored Family", &[("user", Role::Parent)]).await;
    let requested = family_with(&state, "Requested Family", &[("user", Role::Teacher)]).await;

    let mut session = Session::default();
    session.set_selected_family_id(stored);
    let mut ctx = ctx("user", Some(requested.to_string()), session);

    let selected = get_selected_family(state.store.as_ref(), &mut ctx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.id, requested);
    assert_eq!(ctx.session().selected_family_id(), Some(requested));
}

#[tokio::test]
async fn first_parent_family_wins_without_hints() {
    let (state, _) = setup();
    let teacher_family = family_with(&state, "Taught Family", &[("user", Role::Teacher)]).await;
    let first = family_with(&state, "First Family", &[("user", Role::Parent)]).await;
    let second = family_with(&state, "Second Family", &[("user", Role::Parent)]).await;
    assert!(teacher_family < first && first < second);

    let mut ctx = ctx("user", None, Session::default());
    let selected = get_selected_family(state.store.as_ref(), &mut ctx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(selected.id, first);
    assert!(ctx.session().is_modified());
}

#[tokio::test]
async fn teacher_scope_excludes_legacy_records() {
    let (state, _) = setup();
    let family_id = family_with(
        &state,
        "Smith Family",
        &[("parent", Role::Parent), ("teacher", Role::Teacher)],
    )
    .await;

    let parent = access(&state, "parent").await;
    for name in ["Ada", "Ben"] {
        create_student(&state, &parent, student_request(name), now())
            .await
            .unwrap();
    }
    for owner in ["a", "b", "c", "d", "e"] {
        state.store.insert_record(legacy_row(owner)).await.unwrap();
    }

    let mut ctx = ctx("teacher", None, Session::default());
    let students: Vec<Student> = list_records(&state, &mut ctx).await.unwrap();
    assert_eq!(students.len(), 2);
    assert!(students.iter().all(|s| s.family_id == Some(family_id)));
}

#[tokio::test]
async fn teacher_assignments_belong_to_the_family() {
    let (state, _) = setup();
    let family_id = family_with(
        &state,
        "Smith Family",
        &[("parent", Role::Parent), ("teacher", Role::Teacher)],
    )
    .await;
    let parent = access(&state, "parent").await;
    let student = create_student(&state, &parent, student_request("Ada"), now())
        .await
        .unwrap();
    let curriculum = create_curriculum(
        &state,
        &parent,
        CurriculumRequest {
            name: "Singapore Math".to_string(),
            subject: "Math".to_string(),
            grade_level: Some(GradeLevel::G03),
        },
        now(),
    )
    .await
    .unwrap();

    let request = |title: &str| AssignmentRequest {
        student_id: student.id,
        curriculum_id: curriculum.id,
        title: title.to_string(),
        description: String::new(),
        due_date: NaiveDate::from_ymd_opt(2024, 9, 10).unwrap(),
        status: None,
    };

    let mut teacher_ctx = ctx("teacher", None, Session::default());
    let assignment = create_assignment(&state, &mut teacher_ctx, request("Fractions"), now())
        .await
        .unwrap();
    assert_eq!(assignment.owner_id, "parent");
    assert_eq!(assignment.family_id, Some(family_id));
    assert_eq!(assignment.source, AssignmentSource::Teacher);
    assert_eq!(assignment.created_by, "teacher");

    let mut parent_ctx = ctx("parent", None, Session::default());
    let parents_own = create_assignment(&state, &mut parent_ctx, request("Decimals"), now())
        .await
        .unwrap();
    assert_eq!(parents_own.source, AssignmentSource::Parent);

    let mut teacher_ctx = ctx("teacher", None, Session::default());
    assert!(matches!(
        update_assignment(&state, &mut teacher_ctx, parents_own.id, request("Mine now"), now())
            .await,
        Err(AppError::NotFound)
    ));

    let teacher = access(&state, "teacher").await;
    let link = student_status_link(&state, &teacher, assignment.id, now())
        .await
        .unwrap();
    assert!(link.url.ends_with(&link.token));

    let view = student_status_view(&state, &link.token, now()).await.unwrap();
    assert_eq!(view.student_name, "Ada");
    assert_eq!(view.status, AssignmentStatus::Pending);

    let view = student_status_update(&state, &link.token, AssignmentStatus::Submitted, now())
        .await
        .unwrap();
    assert_eq!(view.status, AssignmentStatus::Submitted);

    let later = now() + Duration::days(8);
    assert!(matches!(
        student_status_view(&state, &link.token, later).await,
        Err(AppError::InvalidLink)
    ));
}

fn curriculum_request(name: &str) -> CurriculumRequest {
    CurriculumRequest {
        name: name.to_string(),
        subject: "Math".to_string(),
        grade_level: Some(GradeLevel::G03),
    }
}

fn assignment_request(student_id: i64, curriculum_id: i64, title: &str) -> AssignmentRequest {
    AssignmentRequest {
        student_id,
        curriculum_id,
        title: title.to_string(),
        description: String::new(),
        due_date: NaiveDate::from_ymd_opt(2024, 9, 10).unwrap(),
        status: None,
    }
}

fn link_request(url: &str, link_type: LinkType) -> ResourceLinkRequest {
    ResourceLinkRequest {
        url: url.to_string(),
        label: String::new(),
        link_type,
        window_start: None,
        window_end: None,
    }
}

#[tokio::test]
async fn resend_keeps_the_original_expiry_window() {
    let (state, mailer) = setup();
    family_with(&state, "Smith Family", &[("parent", Role::Parent)]).await;
    let parent = Identity::new("parent");
    let created_at = now() - Duration::days(5);

    let invite = create_invitation(&state, &parent, "teacher@example.com", created_at)
        .await
        .unwrap();
    let resent = resend_invitation(&state, &parent, invite.invite_id, now())
        .await
        .unwrap();
    assert_eq!(resent.status, InvitationStatus::Pending);
    assert_eq!(resent.expires_at, invite.expires_at);

    let stored = state
        .store
        .get_invitation(invite.invite_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.resent_at, Some(now()));
    assert_eq!(stored.created_at, created_at);
    let sent = mailer.sent().await;
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|email| email.to == "teacher@example.com"));

    // Three days after the resend, but eight after creation.
    let past_window = now() + Duration::days(3);
    assert!(matches!(
        resend_invitation(&state, &parent, invite.invite_id, past_window).await,
        Err(AppError::Invitation(InviteRejection::ResendExpired))
    ));
    let stored = state
        .store
        .get_invitation(invite.invite_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, InvitationStatus::Expired);
    assert_eq!(stored.resent_at, Some(now()));
    assert_eq!(mailer.sent().await.len(), 2);
}

#[tokio::test]
async fn failed_delivery_leaves_the_invitation_resendable() {
    let mailer = Arc::new(RecordingMailer::failing());
    let state = AppState::new(
        Arc::new(InMemoryStore::new()),
        mailer.clone(),
        AppConfig::local("integration-secret"),
    );
    family_with(&state, "Smith Family", &[("parent", Role::Parent)]).await;
    let parent = Identity::new("parent");

    let invite = create_invitation(&state, &parent, "teacher@example.com", now())
        .await
        .unwrap();
    assert_eq!(invite.status, InvitationStatus::Pending);
    assert_eq!(pending_invitations(&state, &parent, now()).await.unwrap().len(), 1);

    let later = now() + Duration::hours(2);
    let resent = resend_invitation(&state, &parent, invite.invite_id, later)
        .await
        .unwrap();
    assert_eq!(resent.status, InvitationStatus::Pending);
    assert!(mailer.sent().await.is_empty());
    let stored = state
        .store
        .get_invitation(invite.invite_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.resent_at, Some(later));
}

#[tokio::test]
async fn inviting_requires_a_parent_membership() {
    let (state, mailer) = setup();
    let family_id = family_with(
        &state,
        "Smith Family",
        &[("parent", Role::Parent), ("teacher", Role::Teacher)],
    )
    .await;

    let teacher = Identity::new("teacher");
    assert!(matches!(
        create_invitation(&state, &teacher, "friend@example.com", now()).await,
        Err(AppError::NotFound)
    ));
    assert!(matches!(
        pending_invitations(&state, &teacher, now()).await,
        Err(AppError::NotFound)
    ));

    let newcomer = Identity::new("newcomer");
    match create_invitation(&state, &newcomer, "friend@example.com", now()).await {
        Err(AppError::Validation { field, message }) => {
            assert_eq!(field, None);
            assert_eq!(
                message,
                "You need to belong to a family as a parent before you can invite a teacher."
            );
        }
        other => panic!("expected a validation error, got {other:?}"),
    }

    assert!(state
        .store
        .list_invitations(family_id, None)
        .await
        .unwrap()
        .is_empty());
    assert!(mailer.sent().await.is_empty());
}

#[tokio::test]
async fn deletes_respect_references_and_roles() {
    let (state, _) = setup();
    family_with(
        &state,
        "Smith Family",
        &[("parent", Role::Parent), ("teacher", Role::Teacher)],
    )
    .await;
    let parent = access(&state, "parent").await;
    let teacher = access(&state, "teacher").await;
    let ada = create_student(&state, &parent, student_request("Ada"), now())
        .await
        .unwrap();
    let ben = create_student(&state, &parent, student_request("Ben"), now())
        .await
        .unwrap();
    let math = create_curriculum(&state, &parent, curriculum_request("Singapore Math"), now())
        .await
        .unwrap();
    let mut parent_ctx = ctx("parent", None, Session::default());
    let assignment = create_assignment(
        &state,
        &mut parent_ctx,
        assignment_request(ada.id, math.id, "Fractions"),
        now(),
    )
    .await
    .unwrap();

    match delete_record::<Student>(&state, &parent, ada.id).await {
        Err(AppError::Validation { field: None, message }) => {
            assert_eq!(message, "This student still has assignments and cannot be deleted.")
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(matches!(
        delete_record::<Curriculum>(&state, &parent, math.id).await,
        Err(AppError::Validation { field: None, .. })
    ));
    assert!(get_record::<Student>(&state, &parent, ada.id).await.is_ok());

    assert!(matches!(
        delete_record::<Student>(&state, &teacher, ben.id).await,
        Err(AppError::NotFound)
    ));
    assert!(get_record::<Student>(&state, &teacher, ben.id).await.is_ok());

    delete_record::<Student>(&state, &parent, ben.id).await.unwrap();
    assert!(matches!(
        get_record::<Student>(&state, &parent, ben.id).await,
        Err(AppError::NotFound)
    ));

    delete_record::<Assignment>(&state, &parent, assignment.id)
        .await
        .unwrap();
    delete_record::<Student>(&state, &parent, ada.id).await.unwrap();
}

#[tokio::test]
async fn resource_links_follow_assignment_edit_rights() {
    let (state, _) = setup();
    family_with(
        &state,
        "Smith Family",
        &[("parent", Role::Parent), ("teacher", Role::Teacher)],
    )
    .await;
    let parent = access(&state, "parent").await;
    let teacher = access(&state, "teacher").await;
    let ada = create_student(&state, &parent, student_request("Ada"), now())
        .await
        .unwrap();
    let math = create_curriculum(&state, &parent, curriculum_request("Singapore Math"), now())
        .await
        .unwrap();

    let mut teacher_ctx = ctx("teacher", None, Session::default());
    let taught = create_assignment(
        &state,
        &mut teacher_ctx,
        assignment_request(ada.id, math.id, "Fractions"),
        now(),
    )
    .await
    .unwrap();
    let mut parent_ctx = ctx("parent", None, Session::default());
    let parents_own = create_assignment(
        &state,
        &mut parent_ctx,
        assignment_request(ada.id, math.id, "Decimals"),
        now(),
    )
    .await
    .unwrap();

    let quiz = add_resource_link(
        &state,
        &teacher,
        taught.id,
        link_request("https://quiz.test/fractions", LinkType::Assessment),
        now(),
    )
    .await
    .unwrap();
    assert!(matches!(
        add_resource_link(
            &state,
            &teacher,
            parents_own.id,
            link_request("https://quiz.test/decimals", LinkType::Assessment),
            now(),
        )
        .await,
        Err(AppError::NotFound)
    ));

    let mut backwards = link_request("https://video.test/intro", LinkType::Resource);
    backwards.window_start = Some(now() + Duration::days(2));
    backwards.window_end = Some(now());
    assert!(matches!(
        add_resource_link(&state, &parent, taught.id, backwards, now()).await,
        Err(AppError::Validation { field: Some("window_end"), .. })
    ));

    let detail = assignment_detail(&state, &teacher, taught.id).await.unwrap();
    assert!(detail.can_edit);
    assert!(!detail.can_delete);
    assert_eq!(detail.assessment_links, vec![quiz.clone()]);
    assert!(detail.resource_links.is_empty());

    let link = student_status_link(&state, &teacher, taught.id, now())
        .await
        .unwrap();
    let view = student_status_view(&state, &link.token, now()).await.unwrap();
    assert_eq!(view.assessment_links, vec![quiz.clone()]);

    assert!(matches!(
        delete_resource_link(&state, &teacher, parents_own.id, quiz.id).await,
        Err(AppError::NotFound)
    ));
    delete_record::<Assignment>(&state, &parent, taught.id)
        .await
        .unwrap();
    assert!(state
        .store
        .resource_links_for(taught.id)
        .await
        .unwrap()
        .is_empty());
}
