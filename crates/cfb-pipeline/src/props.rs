//! Proposition reconciliation: map scraped election/measure/committee data
//! onto the canonical tables.
//!
//! Everything here is safe to rerun. Propositions and their filer
//! associations are find-or-create; elections are only looked up and dated,
//! never created.

use chrono::Datelike;
use tracing::{debug, warn};

use cfb_core::{Filer, Position, ScrapedElection};
use cfb_store::{PropositionStore, Result};

/// How a scraped committee reference matched a canonical filer. The ids on
/// the measure pages are ambiguous: sometimes a raw filer id, sometimes a
/// cross-reference id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedVia {
    RawId,
    CrossReference,
}

/// Ordered fallback chain for a scraped committee id: raw filer id first,
/// then cross-reference id. `None` means nobody matched and the reference
/// should be skipped.
pub async fn resolve_filer<S: PropositionStore + ?Sized>(
    store: &S,
    external_id: &str,
) -> Result<Option<(Filer, ResolvedVia)>> {
    let external_id = external_id.trim();
    if let Ok(raw_id) = external_id.parse::<i64>() {
        if let Some(filer) = store.filer_by_raw_id(raw_id).await? {
            return Ok(Some((filer, ResolvedVia::RawId)));
        }
    }
    if let Some(filer) = store.filer_by_xref(external_id).await? {
        return Ok(Some((filer, ResolvedVia::CrossReference)));
    }
    Ok(None)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub propositions: usize,
    pub associations_created: usize,
    pub committees_skipped: usize,
}

/// Reconcile a scrape result against the store. Elections in the future are
/// skipped; ambiguous or missing elections leave the proposition unlinked
/// rather than failing the batch.
pub async fn reconcile_propositions<S: PropositionStore + ?Sized>(
    store: &S,
    scraped: &[ScrapedElection],
    current_year: i32,
) -> Result<ReconcileSummary> {
    let mut summary = ReconcileSummary::default();

    for election in scraped {
        if election.date.year() > current_year {
            debug!(date = %election.date, "skipping future election");
            continue;
        }

        let matches = store
            .elections_for(election.date.year(), &election.kind)
            .await?;
        let election_id = match matches.as_slice() {
            [only] => {
                store.set_election_date(only.id, election.date).await?;
                Some(only.id)
            }
            [] => {
                warn!(
                    year = election.date.year(),
                    kind = %election.kind,
                    "no election matches; leaving propositions unlinked"
                );
                None
            }
            _ => {
                warn!(
                    year = election.date.year(),
                    kind = %election.kind,
                    candidates = matches.len(),
                    "multiple elections match; leaving propositions unlinked"
                );
                None
            }
        };

        for prop in &election.propositions {
            let proposition = store
                .find_or_create_proposition(&prop.name, &prop.external_id)
                .await?;
            store
                .set_proposition_election(proposition.id, election_id)
                .await?;
            summary.propositions += 1;

            for committee in &prop.committees {
                let position = if committee.supports {
                    Position::Support
                } else {
                    Position::Oppose
                };
                match resolve_filer(store, &committee.external_id).await? {
                    Some((filer, via)) => {
                        debug!(
                            external_id = %committee.external_id,
                            filer_id = filer.id,
                            ?via,
                            "resolved committee reference"
                        );
                        let created = store
                            .find_or_create_proposition_filer(proposition.id, filer.id, position)
                            .await?;
                        if created {
                            summary.associations_created += 1;
                        }
                    }
                    None => {
                        warn!(
                            external_id = %committee.external_id,
                            committee = %committee.name,
                            proposition = %prop.name,
                            "no filer matches committee reference; skipping"
                        );
                        summary.committees_skipped += 1;
                    }
                }
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    use cfb_core::{
        Election, FilerType, Proposition, ScrapedCommitteeRef, ScrapedProposition,
    };

    #[derive(Default)]
    struct MemState {
        elections: Vec<Election>,
        propositions: Vec<Proposition>,
        filers: Vec<Filer>,
        associations: Vec<(i64, i64, Position)>,
    }

    #[derive(Default)]
    struct MemStore {
        state: Mutex<MemState>,
    }

    impl MemStore {
        fn with_filers(filers: Vec<Filer>) -> Self {
            let store = Self::default();
            store.state.lock().unwrap().filers = filers;
            store
        }

        fn add_election(&self, id: i64, year: i32, kind: &str) {
            self.state.lock().unwrap().elections.push(Election {
                id,
                year,
                kind: kind.to_string(),
                date: None,
            });
        }

        fn association_count(&self) -> usize {
            self.state.lock().unwrap().associations.len()
        }
    }

    #[async_trait]
    impl PropositionStore for MemStore {
        async fn elections_for(&self, year: i32, kind: &str) -> Result<Vec<Election>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .elections
                .iter()
                .filter(|e| e.year == year && e.kind == kind)
                .cloned()
                .collect())
        }

        async fn set_election_date(&self, election_id: i64, date: NaiveDate) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(election) = state.elections.iter_mut().find(|e| e.id == election_id) {
                election.date = Some(date);
            }
            Ok(())
        }

        async fn find_or_create_proposition(
            &self,
            name: &str,
            external_id: &str,
        ) -> Result<Proposition> {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state
                .propositions
                .iter()
                .find(|p| p.name == name && p.external_id == external_id)
            {
                return Ok(existing.clone());
            }
            let proposition = Proposition {
                id: state.propositions.len() as i64 + 1,
                name: name.to_string(),
                external_id: external_id.to_string(),
                election_id: None,
            };
            state.propositions.push(proposition.clone());
            Ok(proposition)
        }

        async fn set_proposition_election(
            &self,
            proposition_id: i64,
            election_id: Option<i64>,
        ) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(prop) = state
                .propositions
                .iter_mut()
                .find(|p| p.id == proposition_id)
            {
                prop.election_id = election_id;
            }
            Ok(())
        }

        async fn filer_by_raw_id(&self, filer_id_raw: i64) -> Result<Option<Filer>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .filers
                .iter()
                .find(|f| f.filer_id_raw == filer_id_raw)
                .cloned())
        }

        async fn filer_by_xref(&self, xref_filer_id: &str) -> Result<Option<Filer>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .filers
                .iter()
                .find(|f| f.xref_filer_id.as_deref() == Some(xref_filer_id))
                .cloned())
        }

        async fn find_or_create_proposition_filer(
            &self,
            proposition_id: i64,
            filer_id: i64,
            position: Position,
        ) -> Result<bool> {
            let mut state = self.state.lock().unwrap();
            let key = (proposition_id, filer_id, position);
            if state.associations.contains(&key) {
                return Ok(false);
            }
            state.associations.push(key);
            Ok(true)
        }
    }

    fn filer(id: i64, raw: i64, xref: Option<&str>) -> Filer {
        Filer {
            id,
            filer_id_raw: raw,
            status: None,
            effective_date: None,
            xref_filer_id: xref.map(ToString::to_string),
            filer_type: FilerType::Pac,
            name: format!("FILER {id}"),
            party: None,
        }
    }

    fn scraped(
        date: NaiveDate,
        kind: &str,
        committees: Vec<ScrapedCommitteeRef>,
    ) -> ScrapedElection {
        ScrapedElection {
            date,
            kind: kind.to_string(),
            propositions: vec![ScrapedProposition {
                external_id: "1379".to_string(),
                name: "PROPOSITION 041".to_string(),
                committees,
            }],
        }
    }

    fn committee_ref(external_id: &str, supports: bool) -> ScrapedCommitteeRef {
        ScrapedCommitteeRef {
            name: format!("COMMITTEE {external_id}"),
            external_id: external_id.to_string(),
            supports,
        }
    }

    fn june_2014() -> NaiveDate {
        NaiveDate::from_ymd_opt(2014, 6, 3).unwrap()
    }

    #[tokio::test]
    async fn committee_resolved_through_cross_reference_gets_opposed_association() {
        let store = MemStore::with_filers(vec![filer(1, 5551212, Some("777"))]);
        store.add_election(10, 2014, "PRIMARY");
        let input = vec![scraped(june_2014(), "PRIMARY", vec![committee_ref("777", false)])];

        let summary = reconcile_propositions(&store, &input, 2014).await.unwrap();

        assert_eq!(summary.associations_created, 1);
        assert_eq!(summary.committees_skipped, 0);
        let state = store.state.lock().unwrap();
        assert_eq!(state.associations, vec![(1, 1, Position::Oppose)]);
        assert_eq!(state.propositions[0].election_id, Some(10));
        assert_eq!(state.elections[0].date, Some(june_2014()));
    }

    #[tokio::test]
    async fn raw_id_match_wins_over_cross_reference() {
        let store = MemStore::with_filers(vec![
            filer(1, 777, None),
            filer(2, 5551212, Some("777")),
        ]);
        let (found, via) = resolve_filer(&store, "777").await.unwrap().unwrap();
        assert_eq!(found.id, 1);
        assert_eq!(via, ResolvedVia::RawId);
    }

    #[tokio::test]
    async fn non_numeric_ids_still_resolve_through_cross_reference() {
        let store = MemStore::with_filers(vec![filer(1, 5551212, Some("C00123"))]);
        let (found, via) = resolve_filer(&store, " C00123 ").await.unwrap().unwrap();
        assert_eq!(found.id, 1);
        assert_eq!(via, ResolvedVia::CrossReference);
    }

    #[tokio::test]
    async fn unresolvable_committees_are_skipped_without_failing_the_batch() {
        let store = MemStore::with_filers(vec![filer(1, 100, None)]);
        store.add_election(10, 2014, "PRIMARY");
        let input = vec![scraped(
            june_2014(),
            "PRIMARY",
            vec![committee_ref("999", true), committee_ref("100", true)],
        )];

        let summary = reconcile_propositions(&store, &input, 2014).await.unwrap();

        assert_eq!(summary.committees_skipped, 1);
        assert_eq!(summary.associations_created, 1);
        assert_eq!(store.association_count(), 1);
    }

    #[tokio::test]
    async fn reconciling_twice_writes_no_new_rows() {
        let store = MemStore::with_filers(vec![filer(1, 100, None)]);
        store.add_election(10, 2014, "PRIMARY");
        let input = vec![scraped(june_2014(), "PRIMARY", vec![committee_ref("100", true)])];

        let first = reconcile_propositions(&store, &input, 2014).await.unwrap();
        let second = reconcile_propositions(&store, &input, 2014).await.unwrap();

        assert_eq!(first.associations_created, 1);
        assert_eq!(second.associations_created, 0);
        assert_eq!(store.association_count(), 1);
        assert_eq!(store.state.lock().unwrap().propositions.len(), 1);
    }

    #[tokio::test]
    async fn ambiguous_elections_leave_the_proposition_unlinked() {
        let store = MemStore::with_filers(vec![filer(1, 100, None)]);
        store.add_election(10, 2014, "PRIMARY");
        store.add_election(11, 2014, "PRIMARY");
        let input = vec![scraped(june_2014(), "PRIMARY", vec![committee_ref("100", true)])];

        let summary = reconcile_propositions(&store, &input, 2014).await.unwrap();

        assert_eq!(summary.associations_created, 1);
        let state = store.state.lock().unwrap();
        assert_eq!(state.propositions[0].election_id, None);
        // Neither candidate election gets the scraped date.
        assert!(state.elections.iter().all(|e| e.date.is_none()));
    }

    #[tokio::test]
    async fn missing_elections_also_leave_the_proposition_unlinked() {
        let store = MemStore::with_filers(vec![filer(1, 100, None)]);
        let input = vec![scraped(june_2014(), "PRIMARY", vec![committee_ref("100", true)])];

        let summary = reconcile_propositions(&store, &input, 2014).await.unwrap();

        assert_eq!(summary.propositions, 1);
        assert_eq!(
            store.state.lock().unwrap().propositions[0].election_id,
            None
        );
    }

    #[tokio::test]
    async fn future_elections_are_skipped_entirely() {
        let store = MemStore::with_filers(vec![filer(1, 100, None)]);
        store.add_election(10, 2099, "GENERAL");
        let input = vec![scraped(
            NaiveDate::from_ymd_opt(2099, 11, 2).unwrap(),
            "GENERAL",
            vec![committee_ref("100", true)],
        )];

        let summary = reconcile_propositions(&store, &input, 2014).await.unwrap();

        assert_eq!(summary.propositions, 0);
        assert!(store.state.lock().unwrap().propositions.is_empty());
    }
}
