// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::{Deserialize, Serialize};

pub const MAP_SIZE: i64 = 2048;
pub const ZONE_SIZE: i64 = 32;
pub const ZONES_PER_ROW: i64 = MAP_SIZE / ZONE_SIZE;
pub const ZONE_COUNT: usize = (ZONES_PER_ROW * ZONES_PER_ROW) as usize;

pub type ZoneId = u32;

/// Inclusive tile rectangle restricting where scanning may look.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllowedArea {
    #[serde(default)]
    pub min_x: i64,
    #[serde(default = "max_tile")]
    pub max_x: i64,
    #[serde(default)]
    pub min_y: i64,
    #[serde(default = "max_tile")]
    pub max_y: i64,
}

fn max_tile() -> i64 {
    MAP_SIZE - 1
}

impl Default for AllowedArea {
    fn default() -> Self {
        Self {
            min_x: 0,
            max_x: max_tile(),
            min_y: 0,
            max_y: max_tile(),
        }
    }
}

impl AllowedArea {
    pub fn contains(&self, x: i64, y: i64) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }
}

/// Returns true when no areas are configured or the point lies in one of them.
pub fn point_allowed(areas: &[AllowedArea], x: i64, y: i64) -> bool {
    areas.is_empty() || areas.iter().any(|area| area.contains(x, y))
}

pub fn zone_id_for(x: i64, y: i64) -> Option<ZoneId> {
    if !(0..MAP_SIZE).contains(&x) || !(0..MAP_SIZE).contains(&y) {
        return None;
    }
    ZoneId::try_from(x / ZONE_SIZE + ZONES_PER_ROW * (y / ZONE_SIZE)).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    pub id: ZoneId,
    pub zx: i64,
    pub zy: i64,
}

impl Zone {
    pub fn center(&self) -> (i64, i64) {
        (
            self.zx * ZONE_SIZE + ZONE_SIZE / 2,
            self.zy * ZONE_SIZE + ZONE_SIZE / 2,
        )
    }

    pub fn corners(&self) -> [(i64, i64); 4] {
        let x0 = self.zx * ZONE_SIZE;
        let y0 = self.zy * ZONE_SIZE;
        let x1 = x0 + ZONE_SIZE - 1;
        let y1 = y0 + ZONE_SIZE - 1;
        [(x0, y0), (x1, y0), (x0, y1), (x1, y1)]
    }

    pub fn distance_to(&self, x: i64, y: i64) -> f64 {
        let (cx, cy) = self.center();
        (((cx - x).pow(2) + (cy - y).pow(2)) as f64).sqrt()
    }
}

/// Every zone on the map, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ZoneTable {
    zones: Vec<Zone>,
}

impl Default for ZoneTable {
    fn default() -> Self {
        Self::build()
    }
}

impl ZoneTable {
    pub fn build() -> Self {
        let zones = (0..ZONE_COUNT)
            .map(|index| {
                let id = index as ZoneId;
                let zx = index as i64 % ZONES_PER_ROW;
                let zy = index as i64 / ZONES_PER_ROW;
                Zone { id, zx, zy }
            })
            .collect();
        Self { zones }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zone(&self, id: ZoneId) -> Option<&Zone> {
        self.zones.get(id as usize)
    }

    pub fn zone_at(&self, x: i64, y: i64) -> Option<&Zone> {
        zone_id_for(x, y).and_then(|id| self.zone(id))
    }

    /// A zone passes when any corner or its center falls inside an area.
    pub fn zone_allowed(&self, zone: &Zone, areas: &[AllowedArea]) -> bool {
        if areas.is_empty() {
            return true;
        }
        let (cx, cy) = zone.center();
        zone.corners()
            .iter()
            .chain(std::iter::once(&(cx, cy)))
            .any(|&(x, y)| point_allowed(areas, x, y))
    }

    /// Zones within `radius` zones of the home tile, nearest center first.
    pub fn rank_zones(
        &self,
        home_x: i64,
        home_y: i64,
        radius: i64,
        areas: &[AllowedArea],
    ) -> Vec<ZoneId> {
        let Some(home) = self.zone_at(home_x, home_y) else {
            return Vec::new();
        };
        let mut ranked: Vec<(f64, ZoneId)> = self
            .zones
            .iter()
            .filter(|zone| {
                (zone.zx - home.zx).abs() <= radius && (zone.zy - home.zy).abs() <= radius
            })
            .filter(|zone| self.zone_allowed(zone, areas))
            .map(|zone| (zone.distance_to(home_x, home_y), zone.id))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        ranked.into_iter().map(|(_, id)| id).collect()
    }
}
