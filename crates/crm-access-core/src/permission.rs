//! Grant/deny bitmask algebra for object- and field-level security.
//!
//! The effective mask for one object (or field) is the OR of every grant,
//! with the OR of every deny cleared out of it.

/// Object-level (CRUD) permission bits.
pub mod ols {
    pub const READ: u8 = 1;
    pub const CREATE: u8 = 2;
    pub const UPDATE: u8 = 4;
    pub const DELETE: u8 = 8;
    pub const ALL: u8 = READ | CREATE | UPDATE | DELETE;
}

/// Field-level permission bits.
pub mod fls {
    pub const READ: u8 = 1;
    pub const WRITE: u8 = 2;
    pub const ALL: u8 = READ | WRITE;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BitmaskError {
    #[error("object permission bitmask {0} outside 0..={all}", all = ols::ALL)]
    ObjectOutOfRange(i64),

    #[error("field permission bitmask {0} outside 0..={all}", all = fls::ALL)]
    FieldOutOfRange(i64),
}

/// Direction of a cached field-name list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldAccess {
    Read,
    Write,
}

impl FieldAccess {
    pub fn bit(&self) -> u8 {
        match self {
            Self::Read => fls::READ,
            Self::Write => fls::WRITE,
        }
    }

    pub fn from_bit(bit: u8) -> Option<Self> {
        match bit {
            fls::READ => Some(Self::Read),
            fls::WRITE => Some(Self::Write),
            _ => None,
        }
    }
}

pub fn effective<G, D>(grants: G, denies: D) -> u8
where
    G: IntoIterator<Item = u8>,
    D: IntoIterator<Item = u8>,
{
    let granted = grants.into_iter().fold(0, |acc, mask| acc | mask);
    let denied = denies.into_iter().fold(0, |acc, mask| acc | mask);
    granted & !denied
}

pub fn has_ols(permissions: u8, required: u8) -> bool {
    permissions & required == required
}

pub fn has_fls(permissions: u8, access: FieldAccess) -> bool {
    permissions & access.bit() != 0
}

pub fn check_object_bitmask(value: i64) -> Result<u8, BitmaskError> {
    match u8::try_from(value) {
        Ok(mask) if mask <= ols::ALL => Ok(mask),
        _ => Err(BitmaskError::ObjectOutOfRange(value)),
    }
}

pub fn check_field_bitmask(value: i64) -> Result<u8, BitmaskError> {
    match u8::try_from(value) {
        Ok(mask) if mask <= fls::ALL => Ok(mask),
        _ => Err(BitmaskError::FieldOutOfRange(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_are_ored_together() {
        let result = effective([ols::READ, ols::CREATE, ols::READ | ols::UPDATE], []);

        assert_eq!(result, ols::READ | ols::CREATE | ols::UPDATE);
    }

    #[test]
    fn denies_subtract_from_grants() {
        let result = effective([ols::READ | ols::CREATE], [ols::CREATE]);

        assert_eq!(result, ols::READ);
    }

    #[test]
    fn empty_grants_yield_zero_regardless_of_denies() {
        assert_eq!(effective([], []), 0);
        assert_eq!(effective([], [ols::ALL]), 0);
        assert_eq!(effective([], [ols::READ]), 0);
    }

    #[test]
    fn empty_denies_yield_or_of_grants() {
        assert_eq!(
            effective([ols::DELETE, ols::READ], []),
            ols::DELETE | ols::READ
        );
    }

    #[test]
    fn accumulation_order_is_irrelevant() {
        let grants = [ols::READ, ols::UPDATE, ols::DELETE];
        let denies = [ols::UPDATE, ols::CREATE];

        let forward = effective(grants, denies);
        let reversed = effective(grants.into_iter().rev(), denies.into_iter().rev());

        assert_eq!(forward, reversed);
        assert_eq!(forward, ols::READ | ols::DELETE);
    }

    #[test]
    fn matches_closed_form_over_every_small_combination() {
        for a in 0..=ols::ALL {
            for b in 0..=ols::ALL {
                for d in 0..=ols::ALL {
                    assert_eq!(effective([a, b], [d]), (a | b) & !d);
                }
            }
        }
    }

    #[test]
    fn has_ols_requires_every_requested_bit() {
        let perms = ols::READ | ols::UPDATE;

        assert!(has_ols(perms, ols::READ));
        assert!(has_ols(perms, ols::READ | ols::UPDATE));
        assert!(!has_ols(perms, ols::READ | ols::DELETE));
    }

    #[test]
    fn has_fls_checks_direction() {
        assert!(has_fls(fls::READ, FieldAccess::Read));
        assert!(!has_fls(fls::READ, FieldAccess::Write));
        assert!(has_fls(fls::ALL, FieldAccess::Write));
        assert!(!has_fls(0, FieldAccess::Read));
    }

    #[test]
    fn field_access_bits_round_trip() {
        assert_eq!(FieldAccess::from_bit(fls::READ), Some(FieldAccess::Read));
        assert_eq!(FieldAccess::from_bit(fls::WRITE), Some(FieldAccess::Write));
        assert_eq!(FieldAccess::from_bit(fls::ALL), None);
    }

    #[test]
    fn out_of_range_bitmasks_are_rejected_not_masked() {
        assert_eq!(check_object_bitmask(15), Ok(15));
        assert_eq!(
            check_object_bitmask(16),
            Err(BitmaskError::ObjectOutOfRange(16))
        );
        assert_eq!(
            check_object_bitmask(-1),
            Err(BitmaskError::ObjectOutOfRange(-1))
        );
        assert_eq!(check_field_bitmask(3), Ok(3));
        assert_eq!(
            check_field_bitmask(4),
            Err(BitmaskError::FieldOutOfRange(4))
        );
    }
}
