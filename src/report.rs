//! Read-only reporting snapshots.
//!
//! A [`ReportSnapshot`] covers one April-to-March fiscal year: one
//! [`MonthlySheet`] per calendar month, each listing every initiative in
//! scope with that month's KPI totals. Rendering the snapshot into a
//! spreadsheet is left to the caller; [`ReportSnapshot::to_json`] gives a
//! serialized form.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use crate::catalog::StageCatalog;
use crate::initiative::{Initiative, InitiativeId, InitiativeStatus};
use crate::monitoring::{MonitoringEntry, MonitoringMonth};
use crate::role::Identity;
use crate::state_store::StateStore;
use crate::Result;

/// Which initiatives and which fiscal year a report covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFilter {
    /// Restrict to one site; `None` covers every site.
    pub site: Option<String>,
    /// Starting year of the fiscal year (April `fiscal_year` to March of the next).
    pub fiscal_year: i32,
}

impl ReportFilter {
    /// All sites for the fiscal year starting April `fiscal_year`.
    pub fn fiscal_year(fiscal_year: i32) -> Self {
        Self {
            site: None,
            fiscal_year,
        }
    }

    /// Restricts the report to one site.
    pub fn for_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    fn admits(&self, initiative: &Initiative) -> bool {
        self.site.as_deref().map_or(true, |site| initiative.site == site)
    }
}

/// One initiative on one monthly sheet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitiativeRow {
    /// Serial number within the sheet, starting at 1.
    pub serial: usize,
    /// The initiative.
    pub initiative_id: InitiativeId,
    /// Its title.
    pub title: String,
    /// Owning site.
    pub site: String,
    /// Engineering discipline.
    pub discipline: Option<String>,
    /// Initiative Lead, once bound.
    pub initiative_lead: Option<Identity>,
    /// Planned start date.
    pub start_date: Option<NaiveDate>,
    /// Target date.
    pub end_date: Option<NaiveDate>,
    /// Overall status.
    pub status: InitiativeStatus,
    /// Stage awaiting action.
    pub current_stage: u32,
    /// Name of the current stage, shown as the row's remark.
    pub stage_name: String,
    /// Share of applicable stages approved.
    pub progress_percentage: u8,
    /// Expected annual savings.
    pub expected_savings: Option<Decimal>,
    /// Realised savings.
    pub actual_savings: Option<Decimal>,
    /// Actual savings if recorded, otherwise expected savings.
    pub annualized_value: Option<Decimal>,
    /// Sum of the month's KPI targets; zero without entries.
    pub month_target: Decimal,
    /// Sum of the month's achieved values, if any were measured.
    pub month_achieved: Option<Decimal>,
    /// Number of KPI entries the month carries.
    pub entry_count: usize,
}

/// All initiatives for one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlySheet {
    /// Calendar month.
    pub month: MonitoringMonth,
    /// Sheet name such as `Apr.25`.
    pub label: String,
    /// One row per initiative in scope.
    pub rows: Vec<InitiativeRow>,
}

impl MonthlySheet {
    /// Total target across the sheet.
    pub fn total_target(&self) -> Decimal {
        self.rows.iter().map(|r| r.month_target).sum()
    }

    /// Total achieved across the sheet.
    pub fn total_achieved(&self) -> Decimal {
        self.rows.iter().filter_map(|r| r.month_achieved).sum()
    }
}

/// Point-in-time view of a fiscal year.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportSnapshot {
    /// Starting year of the fiscal year.
    pub fiscal_year: i32,
    /// Site filter applied, if any.
    pub site: Option<String>,
    /// When the snapshot was read.
    pub generated_at: DateTime<Utc>,
    /// Twelve sheets, April first.
    pub sheets: Vec<MonthlySheet>,
}

impl ReportSnapshot {
    /// Reads initiatives and their monitoring entries and lays them out by month.
    ///
    /// Nothing is written to the store.
    pub async fn collect<S: StateStore + ?Sized>(
        store: &S,
        catalog: &StageCatalog,
        filter: &ReportFilter,
    ) -> Result<Self> {
        let initiatives: Vec<Initiative> = store
            .list_initiatives()
            .await?
            .into_iter()
            .filter(|i| filter.admits(i))
            .collect();

        let mut entries: BTreeMap<InitiativeId, Vec<MonitoringEntry>> = BTreeMap::new();
        for initiative in &initiatives {
            entries.insert(
                initiative.id,
                store.list_monitoring_entries(&initiative.id).await?,
            );
        }

        let sheets = MonitoringMonth::fiscal_year_months(filter.fiscal_year)
            .into_iter()
            .map(|month| MonthlySheet {
                month,
                label: month.sheet_label(),
                rows: initiatives
                    .iter()
                    .enumerate()
                    .map(|(index, initiative)| {
                        let month_entries: Vec<&MonitoringEntry> = entries
                            .get(&initiative.id)
                            .into_iter()
                            .flatten()
                            .filter(|e| e.month == month)
                            .collect();
                        row(catalog, index + 1, initiative, &month_entries)
                    })
                    .collect(),
            })
            .collect();

        debug!(
            fiscal_year = filter.fiscal_year,
            initiatives = initiatives.len(),
            "report snapshot collected"
        );
        Ok(Self {
            fiscal_year: filter.fiscal_year,
            site: filter.site.clone(),
            generated_at: Utc::now(),
            sheets,
        })
    }

    /// Finds a sheet by its label.
    pub fn sheet(&self, label: &str) -> Option<&MonthlySheet> {
        self.sheets.iter().find(|s| s.label == label)
    }

    /// Serializes the snapshot as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn row(
    catalog: &StageCatalog,
    serial: usize,
    initiative: &Initiative,
    entries: &[&MonitoringEntry],
) -> InitiativeRow {
    let measured: Vec<Decimal> = entries.iter().filter_map(|e| e.achieved_value).collect();
    InitiativeRow {
        serial,
        initiative_id: initiative.id,
        title: initiative.title.clone(),
        site: initiative.site.clone(),
        discipline: initiative.discipline.clone(),
        initiative_lead: initiative.initiative_lead.clone(),
        start_date: initiative.start_date,
        end_date: initiative.end_date,
        status: initiative.status,
        current_stage: initiative.current_stage,
        stage_name: catalog
            .stage_by_number(initiative.current_stage)
            .map(|d| d.name.clone())
            .unwrap_or_default(),
        progress_percentage: initiative.progress_percentage,
        expected_savings: initiative.expected_savings,
        actual_savings: initiative.actual_savings,
        annualized_value: initiative.annualized_value(),
        month_target: entries.iter().map(|e| e.target_value).sum(),
        month_achieved: if measured.is_empty() {
            None
        } else {
            Some(measured.into_iter().sum())
        },
        entry_count: entries.len(),
    }
}
