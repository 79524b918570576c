//! Read-only canonical taxonomy grouped by parent, built once per run.

use std::collections::{HashMap, HashSet};

use admap_core::{CanonicalId, CanonicalUnit, Tier};
use admap_storage::{CanonicalRow, CanonicalSnapshot, CanonicalSource, TaxonomyError};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct CanonicalIndex {
    provinces: Vec<CanonicalUnit>,
    districts_by_province: HashMap<CanonicalId, Vec<CanonicalUnit>>,
    wards_by_district: HashMap<CanonicalId, Vec<CanonicalUnit>>,
    districts: usize,
    wards: usize,
}

impl CanonicalIndex {
    pub async fn load(source: &dyn CanonicalSource) -> Result<Self, TaxonomyError> {
        let snapshot = source.load_snapshot().await?;
        let index = Self::build(&snapshot)?;
        info!(
            provinces = index.provinces.len(),
            districts = index.districts,
            wards = index.wards,
            "canonical taxonomy indexed"
        );
        Ok(index)
    }

    /// Normalize every unit once and group it under its parent, in id order.
    ///
    /// Rejects duplicate ids within a tier and districts or wards whose parent is not in the
    /// snapshot; a partial taxonomy would silently scope matches wrongly.
    pub fn build(snapshot: &CanonicalSnapshot) -> Result<Self, TaxonomyError> {
        let provinces = units(Tier::Province, &snapshot.provinces)?;
        let districts = units(Tier::District, &snapshot.districts)?;
        let wards = units(Tier::Ward, &snapshot.wards)?;

        if let Some(p) = provinces.iter().find(|p| p.parent_id.is_some()) {
            return Err(TaxonomyError::Integrity(format!("province {} has a parent", p.id)));
        }

        let province_ids = provinces.iter().map(|p| p.id).collect::<HashSet<_>>();
        let district_ids = districts.iter().map(|d| d.id).collect::<HashSet<_>>();
        let (district_count, ward_count) = (districts.len(), wards.len());

        Ok(Self {
            districts_by_province: group_by_parent(Tier::District, districts, &province_ids)?,
            wards_by_district: group_by_parent(Tier::Ward, wards, &district_ids)?,
            provinces,
            districts: district_count,
            wards: ward_count,
        })
    }

    pub fn provinces(&self) -> &[CanonicalUnit] {
        &self.provinces
    }

    pub fn districts_of(&self, province_id: CanonicalId) -> &[CanonicalUnit] {
        self.districts_by_province
            .get(&province_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn wards_of(&self, district_id: CanonicalId) -> &[CanonicalUnit] {
        self.wards_by_district
            .get(&district_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Candidate set for a tier: all provinces, or the children of `parent`.
    pub fn scope(&self, tier: Tier, parent: Option<CanonicalId>) -> &[CanonicalUnit] {
        match (tier, parent) {
            (Tier::Province, _) => self.provinces(),
            (Tier::District, Some(id)) => self.districts_of(id),
            (Tier::Ward, Some(id)) => self.wards_of(id),
            (_, None) => &[],
        }
    }

    pub fn len(&self, tier: Tier) -> usize {
        match tier {
            Tier::Province => self.provinces.len(),
            Tier::District => self.districts,
            Tier::Ward => self.wards,
        }
    }
}

fn units(tier: Tier, rows: &[CanonicalRow]) -> Result<Vec<CanonicalUnit>, TaxonomyError> {
    let mut seen = HashSet::with_capacity(rows.len());
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if !seen.insert(row.id) {
            return Err(TaxonomyError::Integrity(format!("duplicate {tier} id {}", row.id)));
        }
        out.push(CanonicalUnit::new(tier, row.id, row.name.clone(), row.parent_id));
    }
    out.sort_by_key(|u| u.id);
    Ok(out)
}

fn group_by_parent(
    tier: Tier,
    units: Vec<CanonicalUnit>,
    parent_ids: &HashSet<CanonicalId>,
) -> Result<HashMap<CanonicalId, Vec<CanonicalUnit>>, TaxonomyError> {
    let mut grouped: HashMap<CanonicalId, Vec<CanonicalUnit>> = HashMap::new();
    for unit in units {
        let parent = unit
            .parent_id
            .filter(|id| parent_ids.contains(id))
            .ok_or_else(|| {
                TaxonomyError::Integrity(format!(
                    "{tier} {} references missing parent {:?}",
                    unit.id, unit.parent_id
                ))
            })?;
        grouped.entry(parent).or_default().push(unit);
    }
    Ok(grouped)
}
