//! Keyed records for equipment, reagents and users.

use crate::{error::LabError, sample_sheet::check_sheet_field, store::next_id};
use labtrack_protocol::{EquipmentId, EquipmentTypeId, ReagentId, ReagentTypeId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentType {
    pub id: EquipmentTypeId,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Equipment {
    pub id: EquipmentId,
    pub external_id: String,
    pub equipment_type: EquipmentTypeId,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReagentType {
    pub id: ReagentTypeId,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reagent {
    pub id: ReagentId,
    pub external_lot_id: String,
    pub reagent_type: ReagentTypeId,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registry {
    pub equipment_types: BTreeMap<EquipmentTypeId, EquipmentType>,
    pub equipment: BTreeMap<EquipmentId, Equipment>,
    pub reagent_types: BTreeMap<ReagentTypeId, ReagentType>,
    pub reagents: BTreeMap<ReagentId, Reagent>,
    pub users: BTreeMap<UserId, User>,
    next_equipment_type: u64,
    next_equipment: u64,
    next_reagent_type: u64,
    next_reagent: u64,
    next_user: u64,
}

fn require_text(field: &str, value: &str) -> Result<(), LabError> {
    if value.trim().is_empty() {
        return Err(LabError::validation(field, format!("{field} must not be empty")));
    }
    Ok(())
}

impl Registry {
    pub fn create_equipment_type(&mut self, description: &str) -> Result<EquipmentTypeId, LabError> {
        require_text("description", description)?;
        let id = next_id(&mut self.next_equipment_type);
        self.equipment_types.insert(
            id,
            EquipmentType {
                id,
                description: description.to_string(),
            },
        );
        Ok(id)
    }

    pub fn create_equipment(
        &mut self,
        external_id: &str,
        equipment_type: EquipmentTypeId,
        notes: Option<String>,
    ) -> Result<EquipmentId, LabError> {
        require_text("external_id", external_id)?;
        if !self.equipment_types.contains_key(&equipment_type) {
            return Err(LabError::not_found("Equipment type", equipment_type));
        }
        let id = next_id(&mut self.next_equipment);
        self.equipment.insert(
            id,
            Equipment {
                id,
                external_id: external_id.to_string(),
                equipment_type,
                notes,
            },
        );
        Ok(id)
    }

    pub fn create_reagent_type(&mut self, description: &str) -> Result<ReagentTypeId, LabError> {
        require_text("description", description)?;
        let id = next_id(&mut self.next_reagent_type);
        self.reagent_types.insert(
            id,
            ReagentType {
                id,
                description: description.to_string(),
            },
        );
        Ok(id)
    }

    pub fn create_reagent(
        &mut self,
        external_lot_id: &str,
        reagent_type: ReagentTypeId,
        notes: Option<String>,
    ) -> Result<ReagentId, LabError> {
        require_text("external_lot_id", external_lot_id)?;
        if !self.reagent_types.contains_key(&reagent_type) {
            return Err(LabError::not_found("Reagent type", reagent_type));
        }
        if self.reagent_by_lot(external_lot_id).is_some() {
            return Err(LabError::validation(
                "external_lot_id",
                format!("Reagent lot '{external_lot_id}' already registered"),
            ));
        }
        let id = next_id(&mut self.next_reagent);
        self.reagents.insert(
            id,
            Reagent {
                id,
                external_lot_id: external_lot_id.to_string(),
                reagent_type,
                notes,
            },
        );
        Ok(id)
    }

    pub fn create_user(&mut self, name: &str, email: &str) -> Result<UserId, LabError> {
        require_text("name", name)?;
        require_text("email", email)?;
        check_sheet_field("name", name)?;
        check_sheet_field("email", email)?;
        if self.users.values().any(|u| u.email == email) {
            return Err(LabError::validation(
                "email",
                format!("User '{email}' already exists"),
            ));
        }
        let id = next_id(&mut self.next_user);
        self.users.insert(
            id,
            User {
                id,
                name: name.to_string(),
                email: email.to_string(),
            },
        );
        Ok(id)
    }

    pub fn equipment(&self, id: EquipmentId) -> Result<&Equipment, LabError> {
        self.equipment
            .get(&id)
            .ok_or_else(|| LabError::not_found("Equipment", id))
    }

    pub fn reagent(&self, id: ReagentId) -> Result<&Reagent, LabError> {
        self.reagents
            .get(&id)
            .ok_or_else(|| LabError::not_found("Reagent", id))
    }

    pub fn user(&self, id: UserId) -> Result<&User, LabError> {
        self.users
            .get(&id)
            .ok_or_else(|| LabError::not_found("User", id))
    }

    pub fn reagent_by_lot(&self, external_lot_id: &str) -> Option<&Reagent> {
        self.reagents
            .values()
            .find(|r| r.external_lot_id == external_lot_id)
    }

    /// Equipment whose type description matches, case-insensitively.
    pub fn list_equipment(&self, type_description: &str) -> Vec<&Equipment> {
        let needle = type_description.trim().to_ascii_lowercase();
        self.equipment
            .values()
            .filter(|e| {
                self.equipment_types
                    .get(&e.equipment_type)
                    .map(|t| t.description.to_ascii_lowercase() == needle)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn set_equipment_notes(&mut self, id: EquipmentId, notes: Option<String>) -> Result<(), LabError> {
        self.equipment
            .get_mut(&id)
            .ok_or_else(|| LabError::not_found("Equipment", id))?
            .notes = notes;
        Ok(())
    }

    pub fn set_reagent_notes(&mut self, id: ReagentId, notes: Option<String>) -> Result<(), LabError> {
        self.reagents
            .get_mut(&id)
            .ok_or_else(|| LabError::not_found("Reagent", id))?
            .notes = notes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labtrack_protocol::ErrorCode;

    #[test]
    fn test_create_equipment_with_and_without_notes() {
        let mut reg = Registry::default();
        let robot = reg.create_equipment_type("Robot").unwrap();
        let mika = reg
            .create_equipment("MIKA", robot, Some("Lazy on fridays".to_string()))
            .unwrap();
        let akim = reg.create_equipment("AKIM", robot, None).unwrap();
        assert_eq!(reg.equipment(mika).unwrap().notes.as_deref(), Some("Lazy on fridays"));
        assert_eq!(reg.equipment(akim).unwrap().external_id, "AKIM");
        assert!(reg.equipment(akim).unwrap().notes.is_none());
        assert_eq!(reg.list_equipment("robot").len(), 2);
        assert!(reg.list_equipment("Sequencer").is_empty());
    }

    #[test]
    fn test_notes_can_be_set_and_cleared() {
        let mut reg = Registry::default();
        let seq = reg.create_equipment_type("Sequencer").unwrap();
        let charles = reg.create_equipment("CHARLES", seq, None).unwrap();
        reg.set_equipment_notes(charles, Some("Needs maintenance".to_string()))
            .unwrap();
        assert_eq!(
            reg.equipment(charles).unwrap().notes.as_deref(),
            Some("Needs maintenance")
        );
        reg.set_equipment_notes(charles, None).unwrap();
        assert!(reg.equipment(charles).unwrap().notes.is_none());
    }

    #[test]
    fn test_reagent_lookup_by_lot() {
        let mut reg = Registry::default();
        let kit = reg.create_reagent_type("extraction kit").unwrap();
        let id = reg.create_reagent("157022406", kit, None).unwrap();
        assert_eq!(reg.reagent_by_lot("157022406").unwrap().id, id);
        let err = reg.create_reagent("157022406", kit, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(reg.reagent(99).unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(
            reg.create_reagent("x", 42, None).unwrap_err().code,
            ErrorCode::NotFound
        );
    }

    #[test]
    fn test_users_are_unique_by_email() {
        let mut reg = Registry::default();
        reg.create_user("Dude", "test@foo.bar").unwrap();
        assert!(reg.create_user("Other", "test@foo.bar").is_err());
        assert!(reg.create_user("", "x@y").is_err());
    }

    #[test]
    fn test_user_fields_cannot_split_sheet_columns() {
        let mut reg = Registry::default();
        let err = reg.create_user("Knight, Rob", "rob@foo.bar").unwrap_err();
        assert_eq!(err.field.as_deref(), Some("name"));
        let err = reg.create_user("Rob", "rob@foo.bar\n").unwrap_err();
        assert_eq!(err.field.as_deref(), Some("email"));
        assert!(reg.users.is_empty());
    }
}
