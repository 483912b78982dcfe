//! Filer and committee reconciliation.
//!
//! The raw export holds many name rows per filer, party assignments in a
//! separate table, undirected candidate/committee links, and filing headers.
//! Four passes collapse that into one canonical filer per real-world entity
//! and one committee per fundraising vehicle, then the store swaps the
//! result in wholesale.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::info;

use cfb_core::{
    assemble_name, Committee, CommitteeType, Filer, FilerType, RawFilerName, RawFilerType,
    RawFiling, RawLink, DISCLOSURE_FORMS, FILER_TYPE_CANDIDATE, FILER_TYPE_RECIPIENT_COMMITTEE,
    LINK_TYPE_CANDIDATE_COMMITTEE,
};
use cfb_store::{PgStore, Result};

/// Allocates the surrogate ids handed out during a rebuild. One sequence per
/// canonical table.
#[derive(Debug, Default)]
pub struct IdSequence(i64);

impl IdSequence {
    pub fn next_id(&mut self) -> i64 {
        self.0 += 1;
        self.0
    }
}

/// Lookup structures shared by the loading passes.
///
/// There is no principled way to pick among a filer's duplicate rows, so the
/// record with the greatest record id wins everywhere.
#[derive(Debug, Default)]
pub struct FilerLookups {
    /// Raw filer id to the record id of the authoritative name row,
    /// restricted to candidate and recipient-committee rows.
    pub max_name_record: BTreeMap<i64, i64>,
    /// Raw filer id to the party off the authoritative type row. No type
    /// filter; the type table groups independently of the name table.
    pub party_by_filer: HashMap<i64, Option<String>>,
    /// Inner join of the two: filers present in both tables. A filer that
    /// never appeared in the type table drops out here and is not loaded.
    pub with_party: BTreeMap<i64, (i64, Option<String>)>,
}

pub fn build_lookups(names: &[RawFilerName], types: &[RawFilerType]) -> FilerLookups {
    let mut max_name_record: BTreeMap<i64, i64> = BTreeMap::new();
    for rec in names {
        if rec.filer_type != FILER_TYPE_CANDIDATE && rec.filer_type != FILER_TYPE_RECIPIENT_COMMITTEE
        {
            continue;
        }
        let entry = max_name_record.entry(rec.filer_id).or_insert(rec.record_id);
        if rec.record_id > *entry {
            *entry = rec.record_id;
        }
    }

    let mut max_type: HashMap<i64, &RawFilerType> = HashMap::new();
    for rec in types {
        match max_type.entry(rec.filer_id) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                if rec.record_id > slot.get().record_id {
                    slot.insert(rec);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(rec);
            }
        }
    }
    let party_by_filer: HashMap<i64, Option<String>> = max_type
        .into_iter()
        .map(|(filer_id, rec)| (filer_id, rec.party.clone()))
        .collect();

    let with_party = max_name_record
        .iter()
        .filter_map(|(filer_id, record_id)| {
            let party = party_by_filer.get(filer_id)?;
            Some((*filer_id, (*record_id, party.clone())))
        })
        .collect();

    FilerLookups {
        max_name_record,
        party_by_filer,
        with_party,
    }
}

pub fn index_by_record_id(names: &[RawFilerName]) -> HashMap<i64, &RawFilerName> {
    names.iter().map(|rec| (rec.record_id, rec)).collect()
}

fn filer_from_record(
    rec: &RawFilerName,
    id: i64,
    filer_type: FilerType,
    party: Option<String>,
) -> Filer {
    Filer {
        id,
        filer_id_raw: rec.filer_id,
        status: rec.status.clone(),
        effective_date: rec.effective_date,
        xref_filer_id: rec.xref_filer_id.clone(),
        filer_type,
        name: assemble_name(&rec.title, &rec.first, &rec.last, &rec.suffix),
        party,
    }
}

/// One candidate filer per authoritative candidate name row that also has a
/// party row. The join in [`build_lookups`] already guarantees one row per
/// raw filer id.
pub fn load_candidate_filers(
    index: &HashMap<i64, &RawFilerName>,
    lookups: &FilerLookups,
    ids: &mut IdSequence,
) -> Vec<Filer> {
    let mut filers = Vec::new();
    for (record_id, party) in lookups.with_party.values() {
        let Some(rec) = index.get(record_id).copied() else {
            continue;
        };
        if rec.filer_type != FILER_TYPE_CANDIDATE {
            continue;
        }
        filers.push(filer_from_record(
            rec,
            ids.next_id(),
            FilerType::Candidate,
            party.clone(),
        ));
    }
    filers
}

/// A directed candidate-controls-committee edge recovered from the
/// undirected link table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommitteeLink {
    pub candidate_filer_id: i64,
    pub candidate_raw_id: i64,
    pub committee_raw_id: i64,
}

/// Direction is inferred by which side already resolved to a candidate.
/// Both orientations of every link are considered, so a pair stored in both
/// directions still yields a single edge (set union, not bag union).
pub fn link_candidate_committees(candidates: &[Filer], links: &[RawLink]) -> BTreeSet<CommitteeLink> {
    let by_raw: HashMap<i64, &Filer> = candidates
        .iter()
        .filter(|f| f.filer_type == FilerType::Candidate)
        .map(|f| (f.filer_id_raw, f))
        .collect();

    let mut edges = BTreeSet::new();
    for link in links {
        if link.link_type != LINK_TYPE_CANDIDATE_COMMITTEE {
            continue;
        }
        let orientations = [
            (link.filer_id_a, link.filer_id_b),
            (link.filer_id_b, link.filer_id_a),
        ];
        for (candidate_side, committee_side) in orientations {
            let (Some(candidate_raw), Some(committee_raw)) = (candidate_side, committee_side)
            else {
                continue;
            };
            if candidate_raw == committee_raw {
                continue;
            }
            if let Some(candidate) = by_raw.get(&candidate_raw) {
                edges.insert(CommitteeLink {
                    candidate_filer_id: candidate.id,
                    candidate_raw_id: candidate_raw,
                    committee_raw_id: committee_raw,
                });
            }
        }
    }
    edges
}

/// Pass one: a committee row per linked committee whose raw id has an
/// authoritative name row, owned by the candidate's filer. Committees with
/// no qualifying name row drop out, same as the join they mirror.
pub fn load_candidate_committees(
    links: &BTreeSet<CommitteeLink>,
    index: &HashMap<i64, &RawFilerName>,
    lookups: &FilerLookups,
    ids: &mut IdSequence,
) -> Vec<Committee> {
    let mut committees = Vec::new();
    for link in links {
        let Some(record_id) = lookups.max_name_record.get(&link.committee_raw_id) else {
            continue;
        };
        let Some(rec) = index.get(record_id) else {
            continue;
        };
        committees.push(Committee {
            id: ids.next_id(),
            filer_id: link.candidate_filer_id,
            filer_id_raw: rec.filer_id,
            xref_filer_id: rec.xref_filer_id.clone(),
            name: assemble_name(&rec.title, &rec.first, &rec.last, &rec.suffix),
            committee_type: CommitteeType::Candidate,
        });
    }
    committees
}

/// Pass two, step one: PAC filers. A filer qualifies when it filed a
/// periodic disclosure form and no committee from pass one already claimed
/// its raw id. The max-record resolution here is scoped to recipient
/// committees over that residual set. Party is optional for PACs.
pub fn load_pac_filers(
    filings: &[RawFiling],
    existing_committees: &[Committee],
    names: &[RawFilerName],
    lookups: &FilerLookups,
    ids: &mut IdSequence,
) -> Vec<Filer> {
    let claimed: HashSet<i64> = existing_committees
        .iter()
        .map(|c| c.filer_id_raw)
        .collect();
    let active: HashSet<i64> = filings
        .iter()
        .filter(|f| DISCLOSURE_FORMS.contains(&f.form_id.as_str()))
        .map(|f| f.filer_id)
        .filter(|id| !claimed.contains(id))
        .collect();

    let mut max_record: BTreeMap<i64, &RawFilerName> = BTreeMap::new();
    for rec in names {
        if rec.filer_type != FILER_TYPE_RECIPIENT_COMMITTEE || !active.contains(&rec.filer_id) {
            continue;
        }
        match max_record.entry(rec.filer_id) {
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                if rec.record_id > slot.get().record_id {
                    slot.insert(rec);
                }
            }
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(rec);
            }
        }
    }

    max_record
        .values()
        .copied()
        .map(|rec| {
            let party = lookups
                .party_by_filer
                .get(&rec.filer_id)
                .cloned()
                .flatten();
            filer_from_record(rec, ids.next_id(), FilerType::Pac, party)
        })
        .collect()
}

/// Pass two, step two: every PAC filer owns exactly one committee, itself.
pub fn load_pac_committees(pac_filers: &[Filer], ids: &mut IdSequence) -> Vec<Committee> {
    pac_filers
        .iter()
        .filter(|f| f.filer_type == FilerType::Pac)
        .map(|f| Committee {
            id: ids.next_id(),
            filer_id: f.id,
            filer_id_raw: f.filer_id_raw,
            xref_filer_id: f.xref_filer_id.clone(),
            name: f.name.clone(),
            committee_type: CommitteeType::Pac,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    pub candidate_filers: usize,
    pub candidate_committees: usize,
    pub pac_filers: usize,
    pub pac_committees: usize,
}

/// Full rebuild: read the four raw tables, run the passes, swap the
/// canonical tables in one transaction.
pub async fn load_filers(store: &PgStore) -> Result<RebuildSummary> {
    info!("reading raw filer tables");
    let names = store.raw_filer_names().await?;
    let types = store.raw_filer_types().await?;
    let raw_links = store.raw_links(LINK_TYPE_CANDIDATE_COMMITTEE).await?;
    let filings = store.raw_filings(&DISCLOSURE_FORMS).await?;

    let lookups = build_lookups(&names, &types);
    let index = index_by_record_id(&names);
    let mut filer_ids = IdSequence::default();
    let mut committee_ids = IdSequence::default();

    let mut filers = load_candidate_filers(&index, &lookups, &mut filer_ids);
    let candidate_filers = filers.len();
    info!(count = candidate_filers, "loaded candidate filers");

    let edges = link_candidate_committees(&filers, &raw_links);
    let mut committees = load_candidate_committees(&edges, &index, &lookups, &mut committee_ids);
    let candidate_committees = committees.len();
    info!(count = candidate_committees, "loaded candidate committees");

    let pacs = load_pac_filers(&filings, &committees, &names, &lookups, &mut filer_ids);
    let pac_committees = load_pac_committees(&pacs, &mut committee_ids);
    info!(count = pacs.len(), "loaded PAC filers and committees");

    let summary = RebuildSummary {
        candidate_filers,
        candidate_committees,
        pac_filers: pacs.len(),
        pac_committees: pac_committees.len(),
    };
    filers.extend(pacs);
    committees.extend(pac_committees);

    store.rebuild_filers_and_committees(&filers, &committees).await?;
    Ok(summary)
}
