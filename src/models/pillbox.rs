use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MAX_COMPARTMENTS;
use crate::error::EngineError;

/// A physical compartment, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compartment {
    pub index: u8,
    pub medication_id: Option<Uuid>,
}

/// A pillbox with a compartment count fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pillbox {
    pub id: Uuid,
    pub owner_id: Uuid,
    compartments: Vec<Compartment>,
    pub created_at: DateTime<Utc>,
}

impl Pillbox {
    pub fn new(owner_id: Uuid, count: u8, created_at: DateTime<Utc>) -> Result<Self, EngineError> {
        if count == 0 || count > MAX_COMPARTMENTS {
            return Err(EngineError::Validation(format!(
                "compartment count {count} outside 1..={MAX_COMPARTMENTS}"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            owner_id,
            compartments: (1..=count)
                .map(|index| Compartment {
                    index,
                    medication_id: None,
                })
                .collect(),
            created_at,
        })
    }

    /// Rebuild from storage. Compartments must be contiguous from 1.
    pub fn from_parts(
        id: Uuid,
        owner_id: Uuid,
        mut compartments: Vec<Compartment>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        compartments.sort_by_key(|c| c.index);
        let contiguous = compartments
            .iter()
            .enumerate()
            .all(|(i, c)| c.index as usize == i + 1);
        if compartments.is_empty() || !contiguous {
            return Err(EngineError::Validation(format!(
                "pillbox {id} has a malformed compartment layout"
            )));
        }
        Ok(Self {
            id,
            owner_id,
            compartments,
            created_at,
        })
    }

    pub fn compartment_count(&self) -> u8 {
        self.compartments.len() as u8
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.compartments
    }

    pub fn compartment(&self, index: u8) -> Option<&Compartment> {
        index
            .checked_sub(1)
            .and_then(|i| self.compartments.get(i as usize))
    }

    pub(crate) fn compartment_mut(&mut self, index: u8) -> Result<&mut Compartment, EngineError> {
        let count = self.compartment_count();
        index
            .checked_sub(1)
            .and_then(|i| self.compartments.get_mut(i as usize))
            .ok_or_else(|| {
                EngineError::Validation(format!("compartment {index} outside 1..={count}"))
            })
    }

    /// Medication currently held by `index`, if any.
    pub fn occupant(&self, index: u8) -> Option<Uuid> {
        self.compartment(index).and_then(|c| c.medication_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn new_pillbox_has_empty_numbered_compartments() {
        let pillbox = Pillbox::new(Uuid::new_v4(), 7, now()).unwrap();
        assert_eq!(pillbox.compartment_count(), 7);
        let indices: Vec<u8> = pillbox.compartments().iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(pillbox.compartments().iter().all(|c| c.medication_id.is_none()));
    }

    #[test]
    fn zero_or_oversized_count_rejected() {
        assert!(Pillbox::new(Uuid::new_v4(), 0, now()).is_err());
        assert!(Pillbox::new(Uuid::new_v4(), 65, now()).is_err());
        assert!(Pillbox::new(Uuid::new_v4(), 64, now()).is_ok());
    }

    #[test]
    fn compartment_lookup_is_one_based() {
        let pillbox = Pillbox::new(Uuid::new_v4(), 3, now()).unwrap();
        assert!(pillbox.compartment(0).is_none());
        assert_eq!(pillbox.compartment(1).unwrap().index, 1);
        assert_eq!(pillbox.compartment(3).unwrap().index, 3);
        assert!(pillbox.compartment(4).is_none());
    }

    #[test]
    fn from_parts_rejects_gaps() {
        let parts = vec![
            Compartment { index: 1, medication_id: None },
            Compartment { index: 3, medication_id: None },
        ];
        assert!(Pillbox::from_parts(Uuid::new_v4(), Uuid::new_v4(), parts, now()).is_err());
    }

    #[test]
    fn occupant_reads_the_compartment() {
        let med = Uuid::new_v4();
        let mut pillbox = Pillbox::new(Uuid::new_v4(), 4, now()).unwrap();
        pillbox.compartment_mut(2).unwrap().medication_id = Some(med);
        assert_eq!(pillbox.occupant(2), Some(med));
        assert_eq!(pillbox.occupant(1), None);
    }
}
