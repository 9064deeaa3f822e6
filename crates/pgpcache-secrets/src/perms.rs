//! Permission masks for keys and scopes.
//!
//! A mask is four 6-bit sets packed one per byte, most significant first:
//! possessor, user, group, other. Each set holds
//! view / read / write / search / link / setattr.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub u32);

impl Permission {
    pub const NONE: Permission = Permission(0);

    pub const OTHER_VIEW: Permission = Permission(1);
    pub const OTHER_READ: Permission = Permission(1 << 1);
    pub const OTHER_WRITE: Permission = Permission(1 << 2);
    pub const OTHER_SEARCH: Permission = Permission(1 << 3);
    pub const OTHER_LINK: Permission = Permission(1 << 4);
    pub const OTHER_SETATTR: Permission = Permission(1 << 5);

    pub const GROUP_VIEW: Permission = Permission(1 << 8);
    pub const GROUP_READ: Permission = Permission(1 << 9);
    pub const GROUP_WRITE: Permission = Permission(1 << 10);
    pub const GROUP_SEARCH: Permission = Permission(1 << 11);
    pub const GROUP_LINK: Permission = Permission(1 << 12);
    pub const GROUP_SETATTR: Permission = Permission(1 << 13);

    pub const USER_VIEW: Permission = Permission(1 << 16);
    pub const USER_READ: Permission = Permission(1 << 17);
    pub const USER_WRITE: Permission = Permission(1 << 18);
    pub const USER_SEARCH: Permission = Permission(1 << 19);
    pub const USER_LINK: Permission = Permission(1 << 20);
    pub const USER_SETATTR: Permission = Permission(1 << 21);

    pub const POSSESSOR_VIEW: Permission = Permission(1 << 24);
    pub const POSSESSOR_READ: Permission = Permission(1 << 25);
    pub const POSSESSOR_WRITE: Permission = Permission(1 << 26);
    pub const POSSESSOR_SEARCH: Permission = Permission(1 << 27);
    pub const POSSESSOR_LINK: Permission = Permission(1 << 28);
    pub const POSSESSOR_SETATTR: Permission = Permission(1 << 29);

    pub const OTHER_ALL: Permission = Permission(0x3f);
    pub const GROUP_ALL: Permission = Permission(0x3f << 8);
    pub const USER_ALL: Permission = Permission(0x3f << 16);
    pub const POSSESSOR_ALL: Permission = Permission(0x3f << 24);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn possessor(self) -> String {
        encode_set((self.0 >> 24) as u8)
    }

    pub fn user(self) -> String {
        encode_set((self.0 >> 16) as u8)
    }

    pub fn group(self) -> String {
        encode_set((self.0 >> 8) as u8)
    }

    pub fn other(self) -> String {
        encode_set(self.0 as u8)
    }
}

const PERM_CHARS: &[u8; 8] = b"--alswrv";

/// Render one permission set as eight characters, highest bit first.
fn encode_set(set: u8) -> String {
    PERM_CHARS
        .iter()
        .enumerate()
        .map(|(i, &c)| {
            if set & (1 << (7 - i)) == 0 {
                '-'
            } else {
                c as char
            }
        })
        .collect()
}

impl fmt::Display for Permission {
    /// Six characters per set (the two unused high bits are dropped).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            &self.possessor()[2..],
            &self.user()[2..],
            &self.group()[2..],
            &self.other()[2..]
        )
    }
}

impl BitOr for Permission {
    type Output = Permission;
    fn bitor(self, rhs: Permission) -> Permission {
        Permission(self.0 | rhs.0)
    }
}

impl BitAnd for Permission {
    type Output = Permission;
    fn bitand(self, rhs: Permission) -> Permission {
        Permission(self.0 & rhs.0)
    }
}

impl BitXor for Permission {
    type Output = Permission;
    fn bitxor(self, rhs: Permission) -> Permission {
        Permission(self.0 ^ rhs.0)
    }
}

impl Not for Permission {
    type Output = Permission;
    fn not(self) -> Permission {
        Permission(!self.0)
    }
}
