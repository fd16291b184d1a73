//! Fixed-dimension well grids addressed by 1-based (row, column).

use crate::{
    error::LabError,
    store::{next_id, LabState},
};
use labtrack_protocol::{ContainerId, PlateConfigurationId, PlateId};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{collections::BTreeMap, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WellPosition {
    pub row: u32,
    pub col: u32,
}

impl WellPosition {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// `A1`-style name. Rows past `Z` continue as `AA`, `AB`, ...
    pub fn name(&self) -> String {
        let mut letters = Vec::new();
        let mut n = self.row;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push(b'A' + rem as u8);
            n = (n - 1) / 26;
        }
        letters.reverse();
        format!("{}{}", String::from_utf8_lossy(&letters), self.col)
    }

    /// Position on a plate with twice the rows and columns when this well
    /// comes from source plate `quadrant` (0-based, at most 3).
    pub fn compressed(&self, quadrant: usize) -> Self {
        let q = quadrant as u32;
        Self {
            row: 2 * (self.row - 1) + q / 2 + 1,
            col: 2 * (self.col - 1) + q % 2 + 1,
        }
    }
}

impl fmt::Display for WellPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlateConfiguration {
    pub id: PlateConfigurationId,
    pub description: String,
    pub num_rows: u32,
    pub num_columns: u32,
}

impl PlateConfiguration {
    pub fn check_bounds(&self, position: WellPosition) -> Result<(), LabError> {
        if position.row < 1 || position.row > self.num_rows {
            return Err(LabError::validation(
                "row",
                format!("Row {} outside 1..={}", position.row, self.num_rows),
            ));
        }
        if position.col < 1 || position.col > self.num_columns {
            return Err(LabError::validation(
                "col",
                format!("Column {} outside 1..={}", position.col, self.num_columns),
            ));
        }
        Ok(())
    }

    pub fn same_shape(&self, other: &PlateConfiguration) -> bool {
        self.num_rows == other.num_rows && self.num_columns == other.num_columns
    }

    /// Every position in row-major order.
    pub fn positions(&self) -> impl Iterator<Item = WellPosition> + '_ {
        (1..=self.num_rows)
            .flat_map(move |row| (1..=self.num_columns).map(move |col| WellPosition { row, col }))
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plate {
    pub id: PlateId,
    pub name: String,
    pub configuration: PlateConfiguration,
    #[serde_as(as = "Vec<(_, _)>")]
    pub wells: BTreeMap<WellPosition, ContainerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateLayoutSummary {
    pub rows: u32,
    pub cols: u32,
    pub editable: bool,
}

impl Plate {
    pub fn new(id: PlateId, name: &str, configuration: PlateConfiguration) -> Self {
        Self {
            id,
            name: name.to_string(),
            configuration,
            wells: BTreeMap::new(),
        }
    }

    pub fn set_well(&mut self, position: WellPosition, container: ContainerId) -> Result<(), LabError> {
        self.configuration.check_bounds(position)?;
        if let Some(existing) = self.wells.get(&position) {
            return Err(LabError::validation(
                "position",
                format!(
                    "Well {position} of plate '{}' already holds container {existing}",
                    self.name
                ),
            ));
        }
        self.wells.insert(position, container);
        Ok(())
    }

    pub fn well(&self, position: WellPosition) -> Option<ContainerId> {
        self.wells.get(&position).copied()
    }

    /// Full `rows x columns` grid; `None` marks an empty position.
    pub fn layout(&self) -> Vec<Vec<Option<ContainerId>>> {
        (1..=self.configuration.num_rows)
            .map(|row| {
                (1..=self.configuration.num_columns)
                    .map(|col| self.well(WellPosition { row, col }))
                    .collect()
            })
            .collect()
    }

    /// Occupied wells in row-major order.
    pub fn occupied(&self) -> impl Iterator<Item = (WellPosition, ContainerId)> + '_ {
        self.wells.iter().map(|(pos, id)| (*pos, *id))
    }

    pub fn layout_summary(&self) -> PlateLayoutSummary {
        PlateLayoutSummary {
            rows: self.configuration.num_rows,
            cols: self.configuration.num_columns,
            editable: self.wells.is_empty(),
        }
    }
}

impl LabState {
    pub fn create_plate_configuration(
        &mut self,
        description: &str,
        num_rows: u32,
        num_columns: u32,
    ) -> Result<PlateConfigurationId, LabError> {
        if num_rows == 0 {
            return Err(LabError::validation("num_rows", "A plate needs at least one row"));
        }
        if num_columns == 0 {
            return Err(LabError::validation(
                "num_columns",
                "A plate needs at least one column",
            ));
        }
        let id = next_id(&mut self.counters.plate_configuration);
        self.plate_configurations.insert(
            id,
            PlateConfiguration {
                id,
                description: description.to_string(),
                num_rows,
                num_columns,
            },
        );
        Ok(id)
    }

    pub fn find_or_create_plate_configuration(
        &mut self,
        num_rows: u32,
        num_columns: u32,
    ) -> Result<PlateConfigurationId, LabError> {
        if let Some(found) = self
            .plate_configurations
            .values()
            .find(|c| c.num_rows == num_rows && c.num_columns == num_columns)
        {
            return Ok(found.id);
        }
        let description = format!("{}-well plate", num_rows * num_columns);
        self.create_plate_configuration(&description, num_rows, num_columns)
    }

    pub fn create_plate(
        &mut self,
        name: &str,
        configuration: PlateConfigurationId,
    ) -> Result<PlateId, LabError> {
        let configuration = self.plate_configuration(configuration)?.clone();
        let id = next_id(&mut self.counters.plate);
        self.plates.insert(id, Plate::new(id, name, configuration));
        Ok(id)
    }
}
