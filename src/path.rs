//! LwM2M data model paths: `/object/instance/resource/resource-instance`.

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::coap::{CoapOption, OptionNumber};

/// Maximum number of path segments.
pub const MAX_PATH_DEPTH: usize = 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path {0:?} does not start with '/'")]
    NotAbsolute(String),

    #[error("Invalid path segment {0:?}")]
    InvalidSegment(String),

    #[error("Path has {0} segments, at most {MAX_PATH_DEPTH} allowed")]
    TooDeep(usize),
}

/// Addressed level of the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathLevel {
    Root,
    Object,
    Instance,
    Resource,
    ResourceInstance,
}

/// A path of up to four 16-bit identifiers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lwm2mPath(Vec<u16>);

impl Lwm2mPath {
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// # Errors
    /// Returns `PathError::TooDeep` for more than four identifiers.
    pub fn new(ids: &[u16]) -> Result<Self, PathError> {
        if ids.len() > MAX_PATH_DEPTH {
            return Err(PathError::TooDeep(ids.len()));
        }
        Ok(Self(ids.to_vec()))
    }

    #[must_use]
    pub fn object(oid: u16) -> Self {
        Self(vec![oid])
    }

    #[must_use]
    pub fn instance(oid: u16, iid: u16) -> Self {
        Self(vec![oid, iid])
    }

    #[must_use]
    pub fn resource(oid: u16, iid: u16, rid: u16) -> Self {
        Self(vec![oid, iid, rid])
    }

    #[must_use]
    pub fn resource_instance(oid: u16, iid: u16, rid: u16, riid: u16) -> Self {
        Self(vec![oid, iid, rid, riid])
    }

    #[must_use]
    pub fn ids(&self) -> &[u16] {
        &self.0
    }

    #[must_use]
    pub fn level(&self) -> PathLevel {
        match self.0.len() {
            0 => PathLevel::Root,
            1 => PathLevel::Object,
            2 => PathLevel::Instance,
            3 => PathLevel::Resource,
            _ => PathLevel::ResourceInstance,
        }
    }

    #[must_use]
    pub fn object_id(&self) -> Option<u16> {
        self.0.first().copied()
    }

    #[must_use]
    pub fn instance_id(&self) -> Option<u16> {
        self.0.get(1).copied()
    }

    #[must_use]
    pub fn resource_id(&self) -> Option<u16> {
        self.0.get(2).copied()
    }

    /// True if `self` equals `other` or addresses a scope containing it.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Lwm2mPath) -> bool {
        other.0.starts_with(&self.0)
    }

    /// Returns a child path one level deeper.
    ///
    /// # Errors
    /// Returns `PathError::TooDeep` when already at resource-instance level.
    pub fn child(&self, id: u16) -> Result<Self, PathError> {
        let mut ids = self.0.clone();
        ids.push(id);
        Self::new(&ids)
    }

    /// Uri-Path options addressing this path.
    #[must_use]
    pub fn to_uri_path_options(&self) -> Vec<CoapOption> {
        self.0
            .iter()
            .map(|id| CoapOption::string(OptionNumber::URI_PATH, &id.to_string()))
            .collect()
    }
}

impl FromStr for Lwm2mPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with('/') {
            return Err(PathError::NotAbsolute(s.to_string()));
        }
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let ids = trimmed[1..]
            .split('/')
            .map(|seg| {
                seg.parse::<u16>()
                    .map_err(|_| PathError::InvalidSegment(seg.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&ids)
    }
}

impl fmt::Display for Lwm2mPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for id in &self.0 {
            write!(f, "/{id}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path: Lwm2mPath = "/3/0/1".parse().unwrap();
        assert_eq!(path.ids(), &[3, 0, 1]);
        assert_eq!(path.level(), PathLevel::Resource);
        assert_eq!(path.to_string(), "/3/0/1");
        assert_eq!("/".parse::<Lwm2mPath>().unwrap(), Lwm2mPath::root());
        assert_eq!(Lwm2mPath::root().to_string(), "/");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "3/0".parse::<Lwm2mPath>(),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            "/3/x".parse::<Lwm2mPath>(),
            Err(PathError::InvalidSegment(_))
        ));
        assert!(matches!(
            "/1/2/3/4/5".parse::<Lwm2mPath>(),
            Err(PathError::TooDeep(5))
        ));
        assert!(matches!(
            "/70000".parse::<Lwm2mPath>(),
            Err(PathError::InvalidSegment(_))
        ));
    }

    #[test]
    fn test_scope() {
        let object = Lwm2mPath::object(3);
        let resource = Lwm2mPath::resource(3, 0, 1);
        assert!(object.is_prefix_of(&resource));
        assert!(resource.is_prefix_of(&resource));
        assert!(!resource.is_prefix_of(&object));
        assert!(Lwm2mPath::root().is_prefix_of(&object));
        assert!(!Lwm2mPath::object(4).is_prefix_of(&resource));
    }

    #[test]
    fn test_child() {
        let path = Lwm2mPath::resource(3, 0, 7).child(1).unwrap();
        assert_eq!(path.to_string(), "/3/0/7/1");
        assert!(path.child(0).is_err());
    }
}
