//! Resource histogram: how many people (or hours) the planned tasks demand
//! per day or per week, broken down by role.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::calendar::{self, HOURS_PER_WORK_DAY, WORK_DAYS_PER_WEEK};
use crate::models::{Resource, Task};

/// Capacity limit used when the caller does not configure one.
pub const DEFAULT_CAPACITY_LIMIT: f64 = 20.0;

/// Ranges longer than this are shown week by week.
const DAILY_RANGE_MAX_DAYS: i64 = 30;

/// Most buckets one histogram may have.
pub const MAX_BUCKETS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    #[default]
    Headcount,
    Hours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeStep {
    Daily,
    #[default]
    Weekly,
}

impl TimeStep {
    pub fn stride_days(self) -> i64 {
        match self {
            TimeStep::Daily => 1,
            TimeStep::Weekly => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramQuery {
    /// `None` aggregates every project of the tenant.
    pub project_id: Option<String>,
    pub mode: DisplayMode,
    pub step: TimeStep,
    /// `None` uses the full planned range of the selected tasks.
    pub range: Option<DateRange>,
    /// Role names to include; empty includes every role.
    pub role_filters: Vec<String>,
    /// Headcount limit; converted to hours in hours mode.
    pub capacity_limit: f64,
    /// Skip summary rows (single-level wbs).
    pub leaf_tasks_only: bool,
}

impl Default for HistogramQuery {
    fn default() -> Self {
        Self {
            project_id: None,
            mode: DisplayMode::default(),
            step: TimeStep::default(),
            range: None,
            role_filters: Vec::new(),
            capacity_limit: DEFAULT_CAPACITY_LIMIT,
            leaf_tasks_only: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub start: NaiveDate,
    pub label: String,
    pub by_role: BTreeMap<String, f64>,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Histogram {
    pub buckets: Vec<Bucket>,
    pub roles: Vec<String>,
    pub effective_limit: f64,
    pub is_overloaded: bool,
    /// Mean over buckets with activity only.
    pub average: f64,
}

fn in_project(task: &Task, project_id: Option<&str>) -> bool {
    project_id.map_or(true, |id| task.project_id == id)
}

/// Earliest planned start to latest planned end of the project's tasks.
pub fn full_date_range(tasks: &[Task], project_id: Option<&str>) -> Option<DateRange> {
    let selected = tasks.iter().filter(|t| in_project(t, project_id));
    selected.fold(None, |range: Option<DateRange>, task| {
        Some(match range {
            None => DateRange {
                start: task.planned_start,
                end: task.planned_end,
            },
            Some(r) => DateRange {
                start: r.start.min(task.planned_start),
                end: r.end.max(task.planned_end),
            },
        })
    })
}

pub fn suggested_step(range: &DateRange) -> TimeStep {
    if range.span_days() > DAILY_RANGE_MAX_DAYS {
        TimeStep::Weekly
    } else {
        TimeStep::Daily
    }
}

/// Names of every resource referenced by an allocation of the selected
/// tasks, sorted. Stale references are skipped.
pub fn available_roles(tasks: &[Task], resources: &[Resource], project_id: Option<&str>) -> Vec<String> {
    let by_id: HashMap<&str, &Resource> = resources.iter().map(|r| (r.id.as_str(), r)).collect();
    let roles: BTreeSet<String> = tasks
        .iter()
        .filter(|t| in_project(t, project_id))
        .flat_map(|t| t.allocations.iter())
        .filter_map(|a| by_id.get(a.resource_id.as_str()))
        .filter(|r| !r.name.is_empty())
        .map(|r| r.name.clone())
        .collect();
    roles.into_iter().collect()
}

/// The headcount limit in the unit and granularity being displayed.
pub fn effective_limit(capacity_limit: f64, mode: DisplayMode, step: TimeStep) -> f64 {
    match (mode, step) {
        (DisplayMode::Headcount, _) => capacity_limit,
        (DisplayMode::Hours, TimeStep::Daily) => capacity_limit * HOURS_PER_WORK_DAY,
        (DisplayMode::Hours, TimeStep::Weekly) => {
            capacity_limit * HOURS_PER_WORK_DAY * WORK_DAYS_PER_WEEK
        }
    }
}

/// What one allocation adds to the bucket starting at `bucket_start`.
///
/// Headcount counts the quantity once if the task works on any day of the
/// bucket; hours accumulate over every working day.
fn contribution(
    quantity: f64,
    task: &Task,
    bucket_start: NaiveDate,
    step: TimeStep,
    mode: DisplayMode,
) -> f64 {
    let bucket_end = bucket_start + Duration::days(step.stride_days() - 1);
    let from = task.planned_start.max(bucket_start);
    let to = task.planned_end.min(bucket_end);
    let active_days = calendar::work_days(from, to).count();

    match mode {
        DisplayMode::Hours => active_days as f64 * quantity * HOURS_PER_WORK_DAY,
        DisplayMode::Headcount if active_days > 0 => quantity,
        DisplayMode::Headcount => 0.0,
    }
}

/// Buckets needed to cover `range` at `step`.
pub fn bucket_count(range: &DateRange, step: TimeStep) -> usize {
    match range.span_days() {
        span if span < 0 => 0,
        span => usize::try_from(span / step.stride_days() + 1).unwrap_or(usize::MAX),
    }
}

/// Never more than [`MAX_BUCKETS`]; later buckets are dropped.
fn bucket_starts(range: &DateRange, step: TimeStep) -> Vec<NaiveDate> {
    let mut starts = Vec::with_capacity(bucket_count(range, step).min(MAX_BUCKETS));
    let mut current = range.start;
    while current <= range.end && starts.len() < MAX_BUCKETS {
        starts.push(current);
        current += Duration::days(step.stride_days());
    }
    starts
}

pub fn aggregate(tasks: &[Task], resources: &[Resource], query: &HistogramQuery) -> Histogram {
    let project_id = query.project_id.as_deref();
    let roles = available_roles(tasks, resources, project_id);
    let effective_limit = effective_limit(query.capacity_limit, query.mode, query.step);

    let range = query.range.or_else(|| full_date_range(tasks, project_id));
    let starts = range
        .map(|r| bucket_starts(&r, query.step))
        .unwrap_or_default();

    let mut buckets: Vec<Bucket> = starts
        .into_iter()
        .map(|start| Bucket {
            start,
            label: start.format("%d/%m").to_string(),
            by_role: roles.iter().map(|r| (r.clone(), 0.0)).collect(),
            total: 0.0,
        })
        .collect();

    let by_id: HashMap<&str, &Resource> = resources.iter().map(|r| (r.id.as_str(), r)).collect();
    let selected = tasks
        .iter()
        .filter(|t| in_project(t, project_id))
        .filter(|t| !query.leaf_tasks_only || t.is_leaf());

    for task in selected {
        for allocation in &task.allocations {
            let Some(resource) = by_id.get(allocation.resource_id.as_str()) else {
                continue;
            };
            if !query.role_filters.is_empty() && !query.role_filters.contains(&resource.name) {
                continue;
            }

            for bucket in &mut buckets {
                let value =
                    contribution(allocation.quantity, task, bucket.start, query.step, query.mode);
                *bucket.by_role.entry(resource.name.clone()).or_insert(0.0) += value;
                bucket.total += value;
            }
        }
    }

    let is_overloaded = buckets.iter().any(|b| b.total > effective_limit);
    let active: Vec<f64> = buckets
        .iter()
        .map(|b| b.total)
        .filter(|total| *total > 0.0)
        .collect();
    let average = if active.is_empty() {
        0.0
    } else {
        active.iter().sum::<f64>() / active.len() as f64
    };

    Histogram {
        buckets,
        roles,
        effective_limit,
        is_overloaded,
        average,
    }
}
