use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::resources::list_records;
use crate::selector::RequestContext;
use crate::types::{Assignment, AssignmentStatus, Curriculum, RecordId, Student};
use crate::AppState;

/// Optional narrowing of the dashboard. All bounds are inclusive.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DashboardFilter {
    pub student_id: Option<RecordId>,
    pub curriculum_id: Option<RecordId>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl DashboardFilter {
    fn matches(&self, assignment: &Assignment) -> bool {
        self.student_id.map_or(true, |id| assignment.student_id == id)
            && self.curriculum_id.map_or(true, |id| assignment.curriculum_id == id)
            && self.start_date.map_or(true, |d| assignment.due_date >= d)
            && self.end_date.map_or(true, |d| assignment.due_date <= d)
    }

    pub fn is_active(&self) -> bool {
        self != &Self::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Tally {
    pub total: usize,
    pub completed: usize,
    pub overdue: usize,
}

impl Tally {
    fn add(&mut self, assignment: &Assignment, today: NaiveDate) {
        self.total += 1;
        if assignment.status == AssignmentStatus::Complete {
            self.completed += 1;
        }
        if assignment.is_overdue(today) {
            self.overdue += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Summary {
    #[serde(flatten)]
    pub tally: Tally,
    pub not_completed: usize,
    pub progress_pct: u32,
}

impl From<Tally> for Summary {
    fn from(tally: Tally) -> Self {
        Self {
            not_completed: tally.total - tally.completed,
            progress_pct: percent_half_even(tally.completed, tally.total),
            tally,
        }
    }
}

/// Whole percentage, ties rounded to the even neighbour. Zero when empty.
fn percent_half_even(part: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    let scaled = part * 100;
    let (quotient, remainder) = (scaled / total, scaled % total);
    let rounded = match (remainder * 2).cmp(&total) {
        std::cmp::Ordering::Less => quotient,
        std::cmp::Ordering::Greater => quotient + 1,
        std::cmp::Ordering::Equal => quotient + quotient % 2,
    };
    rounded as u32
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StudentBreakdown {
    pub student_id: RecordId,
    pub first_name: String,
    pub last_name: String,
    #[serde(flatten)]
    pub tally: Tally,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CurriculumBreakdown {
    pub curriculum_id: RecordId,
    pub name: String,
    #[serde(flatten)]
    pub tally: Tally,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub summary: Summary,
    pub by_student: Vec<StudentBreakdown>,
    pub by_curriculum: Vec<CurriculumBreakdown>,
    /// Filtered assignments ordered by due date, then title.
    pub assignments: Vec<Assignment>,
    pub has_filters: bool,
}

/// Pure aggregation over assignments the caller is already allowed to see.
pub fn summarize(
    assignments: Vec<Assignment>,
    students: &[Student],
    curricula: &[Curriculum],
    filter: &DashboardFilter,
    today: NaiveDate,
) -> Dashboard {
    let mut assignments: Vec<_> = assignments.into_iter().filter(|a| filter.matches(a)).collect();
    assignments.sort_by(|a, b| (a.due_date, &a.title).cmp(&(b.due_date, &b.title)));

    let mut total = Tally::default();
    let mut per_student: BTreeMap<RecordId, Tally> = BTreeMap::new();
    let mut per_curriculum: BTreeMap<RecordId, Tally> = BTreeMap::new();
    for assignment in &assignments {
        total.add(assignment, today);
        per_student
            .entry(assignment.student_id)
            .or_default()
            .add(assignment, today);
        per_curriculum
            .entry(assignment.curriculum_id)
            .or_default()
            .add(assignment, today);
    }

    let mut by_student: Vec<_> = per_student
        .into_iter()
        .map(|(student_id, tally)| {
            let student = students.iter().find(|s| s.id == student_id);
            StudentBreakdown {
                student_id,
                first_name: student.map(|s| s.first_name.clone()).unwrap_or_default(),
                last_name: student.map(|s| s.last_name.clone()).unwrap_or_default(),
                tally,
            }
        })
        .collect();
    by_student.sort_by(|a, b| a.first_name.cmp(&b.first_name));

    let mut by_curriculum: Vec<_> = per_curriculum
        .into_iter()
        .map(|(curriculum_id, tally)| CurriculumBreakdown {
            curriculum_id,
            name: curricula
                .iter()
                .find(|c| c.id == curriculum_id)
                .map(|c| c.name.clone())
                .unwrap_or_default(),
            tally,
        })
        .collect();
    by_curriculum.sort_by(|a, b| a.name.cmp(&b.name));

    Dashboard {
        summary: total.into(),
        by_student,
        by_curriculum,
        assignments,
        has_filters: filter.is_active(),
    }
}

/// Dashboard over the selected family's assignments.
pub async fn dashboard(
    state: &AppState,
    ctx: &mut RequestContext,
    filter: &DashboardFilter,
    today: NaiveDate,
) -> AppResult<Dashboard> {
    let assignments: Vec<Assignment> = list_records(state, ctx).await?;
    let students: Vec<Student> = list_records(state, ctx).await?;
    let curricula: Vec<Curriculum> = list_records(state, ctx).await?;
    Ok(summarize(assignments, &students, &curricula, filter, today))
}
