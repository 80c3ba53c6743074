use chrono::{DateTime, NaiveDate, Utc};
use homeschool_shared::dashboard::{self, DashboardFilter};
use homeschool_shared::error::{AppError, AppResult};
use homeschool_shared::http::{
    error_response, identity_from_request, parse_json, preflight_response, query_param,
    with_cookie, Reply,
};
use homeschool_shared::resources::{self, delete_record, get_record, list_records};
use homeschool_shared::selector::RequestContext;
use homeschool_shared::session::Session;
use homeschool_shared::types::{
    Assignment, CreateInviteRequest, Curriculum, RecordId, StatusUpdateRequest, Student,
};
use homeschool_shared::{families, invitations, users, AppState};
use lambda_http::{http::Method, Body, Error, Request, Response};
use std::sync::Arc;
use uuid::Uuid;

/// Main Lambda handler - routes public links first, then authenticated endpoints
pub(crate) async fn function_handler(
    event: Request,
    state: Arc<AppState>,
) -> Result<Response<Body>, Error> {
    let now = Utc::now();
    let method = event.method().clone();
    let path = event.uri().path().to_string();
    tracing::info!("API invoked - Method: {} Path: {}", method, path);

    if method == Method::OPTIONS {
        return preflight_response();
    }

    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    // Invitation previews and student status links work without a login
    if let Some(result) = public_route(&state, &event, &parts, now).await {
        return respond(result);
    }

    let Some(identity) = identity_from_request(&event, state.config.allow_header_identity) else {
        tracing::warn!("Rejected unauthenticated request to {}", path);
        return error_response(&AppError::Unauthenticated);
    };

    let cookie = event
        .headers()
        .get("Cookie")
        .and_then(|v| v.to_str().ok());
    let session = Session::from_cookie_header(cookie, &state.signer, now);
    let mut ctx = RequestContext::new(identity, query_param(&event, "family_id"), session);

    let result = route(&state, &event, &parts, &mut ctx, now).await;
    let response = respond(result)?;

    let session = ctx.into_session();
    match session.set_cookie_header(&state.signer, state.config.session_cookie_secure, now)? {
        Some(cookie) => with_cookie(response, &cookie),
        None => Ok(response),
    }
}

fn respond(result: AppResult<Reply>) -> Result<Response<Body>, Error> {
    match result {
        Ok(reply) => reply.into_response(),
        Err(err) => error_response(&err),
    }
}

async fn public_route(
    state: &AppState,
    event: &Request,
    parts: &[&str],
    now: DateTime<Utc>,
) -> Option<AppResult<Reply>> {
    let result = match (event.method(), parts) {
        (&Method::GET, ["invites", id]) => match invite_id(id) {
            Ok(id) => invitations::invitation_details(state, id, now)
                .await
                .and_then(|details| Reply::ok(&details)),
            Err(err) => Err(err),
        },
        (&Method::GET, ["status", token]) => resources::student_status_view(state, token, now)
            .await
            .and_then(|view| Reply::ok(&view)),
        (&Method::POST, ["status", token]) => {
            match parse_json::<StatusUpdateRequest>(event.body()) {
                Ok(req) => resources::student_status_update(state, token, req.status, now)
                    .await
                    .and_then(|view| Reply::ok(&view)),
                Err(err) => Err(err),
            }
        }
        _ => return None,
    };
    Some(result)
}

async fn route(
    state: &AppState,
    event: &Request,
    parts: &[&str],
    ctx: &mut RequestContext,
    now: DateTime<Utc>,
) -> AppResult<Reply> {
    let store = state.store.as_ref();
    let body = event.body();

    match (event.method(), parts) {
        // Profile
        (&Method::POST, ["users"]) => {
            let user = users::upsert_user(store, ctx.identity(), parse_json(body)?, now).await?;
            Reply::ok(&user)
        }
        (&Method::GET, ["users", "me"]) => Reply::ok(&users::get_user(store, ctx.identity()).await?),

        // Family selection
        (&Method::GET, ["families"]) => Reply::ok(&families::families_overview(store, ctx).await?),
        (&Method::POST, ["families"]) => {
            let family = families::create_family(state, ctx.identity(), parse_json(body)?).await?;
            Reply::created(&family)
        }

        // Organizations
        (&Method::POST, ["organizations"]) => {
            let org =
                families::create_organization(state, ctx.identity(), parse_json(body)?).await?;
            Reply::created(&org)
        }
        (&Method::GET, ["organizations", id]) => {
            let id = record_id(id)?;
            let access = ctx.access(store).await?;
            Reply::ok(&families::get_organization(state, access, id).await?)
        }

        // Invitations
        (&Method::GET, ["invites"]) => {
            Reply::ok(&invitations::pending_invitations(state, ctx.identity(), now).await?)
        }
        (&Method::POST, ["invites"]) => {
            let req: CreateInviteRequest = parse_json(body)?;
            let invite =
                invitations::create_invitation(state, ctx.identity(), &req.email, now).await?;
            Reply::created(&invite)
        }
        (&Method::POST, ["invites", id, "resend"]) => {
            let invite =
                invitations::resend_invitation(state, ctx.identity(), invite_id(id)?, now).await?;
            Reply::ok(&invite)
        }
        (&Method::POST, ["invites", id, "accept"]) => {
            let accepted =
                invitations::accept_invitation(state, ctx.identity(), invite_id(id)?, now).await?;
            Reply::ok(&accepted)
        }

        // Students
        (&Method::GET, ["students"]) => Reply::ok(&list_records::<Student>(state, ctx).await?),
        (&Method::POST, ["students"]) => {
            let access = ctx.access(store).await?;
            Reply::created(&resources::create_student(state, access, parse_json(body)?, now).await?)
        }
        (&Method::GET, ["students", id]) => {
            let access = ctx.access(store).await?;
            Reply::ok(&get_record::<Student>(state, access, record_id(id)?).await?)
        }
        (&Method::PATCH, ["students", id]) => {
            let id = record_id(id)?;
            let access = ctx.access(store).await?;
            Reply::ok(&resources::update_student(state, access, id, parse_json(body)?, now).await?)
        }
        (&Method::DELETE, ["students", id]) => {
            let id = record_id(id)?;
            delete_record::<Student>(state, ctx.access(store).await?, id).await?;
            Ok(Reply::no_content())
        }

        // Curricula
        (&Method::GET, ["curricula"]) => Reply::ok(&list_records::<Curriculum>(state, ctx).await?),
        (&Method::POST, ["curricula"]) => {
            let access = ctx.access(store).await?;
            Reply::created(
                &resources::create_curriculum(state, access, parse_json(body)?, now).await?,
            )
        }
        (&Method::GET, ["curricula", id]) => {
            let access = ctx.access(store).await?;
            Reply::ok(&get_record::<Curriculum>(state, access, record_id(id)?).await?)
        }
        (&Method::PATCH, ["curricula", id]) => {
            let id = record_id(id)?;
            let access = ctx.access(store).await?;
            Reply::ok(
                &resources::update_curriculum(state, access, id, parse_json(body)?, now).await?,
            )
        }
        (&Method::DELETE, ["curricula", id]) => {
            let id = record_id(id)?;
            delete_record::<Curriculum>(state, ctx.access(store).await?, id).await?;
            Ok(Reply::no_content())
        }

        // Assignments
        (&Method::GET, ["assignments"]) => Reply::ok(&resources::list_assignments(state, ctx).await?),
        (&Method::POST, ["assignments"]) => Reply::created(
            &resources::create_assignment(state, ctx, parse_json(body)?, now).await?,
        ),
        (&Method::GET, ["assignments", id]) => {
            let access = ctx.access(store).await?;
            Reply::ok(&resources::assignment_detail(state, access, record_id(id)?).await?)
        }
        (&Method::PATCH, ["assignments", id]) => {
            let id = record_id(id)?;
            Reply::ok(&resources::update_assignment(state, ctx, id, parse_json(body)?, now).await?)
        }
        (&Method::DELETE, ["assignments", id]) => {
            let id = record_id(id)?;
            delete_record::<Assignment>(state, ctx.access(store).await?, id).await?;
            Ok(Reply::no_content())
        }
        (&Method::GET, ["assignments", id, "status-link"]) => {
            let id = record_id(id)?;
            let access = ctx.access(store).await?;
            Reply::ok(&resources::student_status_link(state, access, id, now).await?)
        }
        (&Method::POST, ["assignments", id, "links"]) => {
            let id = record_id(id)?;
            let access = ctx.access(store).await?;
            let link =
                resources::add_resource_link(state, access, id, parse_json(body)?, now).await?;
            Reply::created(&link)
        }
        (&Method::DELETE, ["assignments", id, "links", link_id]) => {
            let (id, link_id) = (record_id(id)?, record_id(link_id)?);
            let access = ctx.access(store).await?;
            resources::delete_resource_link(state, access, id, link_id).await?;
            Ok(Reply::no_content())
        }

        (&Method::GET, ["dashboard"]) => {
            let filter = dashboard_filter(event)?;
            Reply::ok(&dashboard::dashboard(state, ctx, &filter, now.date_naive()).await?)
        }

        _ => {
            tracing::warn!("No route for {} /{}", event.method(), parts.join("/"));
            Err(AppError::NotFound)
        }
    }
}

fn record_id(raw: &str) -> AppResult<RecordId> {
    raw.parse().map_err(|_| AppError::NotFound)
}

fn invite_id(raw: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::NotFound)
}

fn dashboard_filter(event: &Request) -> AppResult<DashboardFilter> {
    let id = |name: &'static str| -> AppResult<Option<RecordId>> {
        query_param(event, name)
            .filter(|v| !v.is_empty())
            .map(|v| {
                v.parse()
                    .map_err(|_| AppError::validation(name, "Enter a whole number."))
            })
            .transpose()
    };
    let date = |name: &'static str| -> AppResult<Option<NaiveDate>> {
        query_param(event, name)
            .filter(|v| !v.is_empty())
            .map(|v| {
                NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                    .map_err(|_| AppError::validation(name, "Enter a valid date."))
            })
            .transpose()
    };

    Ok(DashboardFilter {
        student_id: id("student_id")?,
        curriculum_id: id("curriculum_id")?,
        start_date: date("start_date")?,
        end_date: date("end_date")?,
    })
}
