//! Host blacklist and host-exclusion constraints.
//!
//! The blacklist starts from an optional file (one hostname per line) and
//! grows during a run whenever a recipe set fails on infrastructure. Growth
//! stays in memory: a host that misbehaved once is avoided for the rest of
//! the run but not written back to the source file.
//!
//! [`exclude_hosts`] turns the blacklist into Beaker host requirements:
//!
//! ```xml
//! <hostRequires>
//!   <and>
//!     <hostname op="!=" value="host1"/>
//!     <hostname op="!=" value="host2"/>
//!   </and>
//! </hostRequires>
//! ```

use std::path::{Path, PathBuf};

use crate::xml::Element;

#[derive(Debug, thiserror::Error)]
#[error("Can't access blacklist {path}: {source}")]
pub struct BlacklistError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Ordered set of excluded hostnames.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    hosts: Vec<String>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads hostnames from a file, one per line. Blank lines are ignored.
    pub fn load(path: &Path) -> Result<Self, BlacklistError> {
        let content = std::fs::read_to_string(path).map_err(|source| BlacklistError {
            path: path.to_path_buf(),
            source,
        })?;

        let mut blacklist = Self::new();
        for line in content.lines() {
            blacklist.insert(line);
        }
        Ok(blacklist)
    }

    /// Adds a host; returns false if it was already present or empty.
    pub fn insert(&mut self, host: &str) -> bool {
        let host = host.trim();
        if host.is_empty() || self.contains(host) {
            return false;
        }
        self.hosts.push(host.to_string());
        true
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// A copy without the given host.
    pub fn without(&self, host: &str) -> Self {
        Self {
            hosts: self.hosts.iter().filter(|h| *h != host).cloned().collect(),
        }
    }
}

impl<S: AsRef<str>> FromIterator<S> for Blacklist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut blacklist = Self::new();
        for host in iter {
            blacklist.insert(host.as_ref());
        }
        blacklist
    }
}

/// Returns a copy of `host_requires` with one `hostname != host` constraint
/// per blacklisted host.
///
/// Constraints go into the direct `<and>` child, which is created when
/// missing. Existing constraints are kept and not deduplicated, so calling
/// this twice on the same tree adds the constraints twice.
pub fn exclude_hosts(host_requires: &Element, blacklist: &Blacklist) -> Element {
    let mut result = host_requires.clone();
    if blacklist.is_empty() {
        return result;
    }

    if result.child("and").is_none() {
        result.push(Element::new("and"));
    }
    if let Some(and) = result.child_mut("and") {
        for host in blacklist.hosts() {
            and.push(
                Element::new("hostname")
                    .with_attr("op", "!=")
                    .with_attr("value", host.as_str()),
            );
        }
    }
    result
}

/// Applies [`exclude_hosts`] to every `hostRequires` of every recipe in a
/// job document, adding an empty `hostRequires` where a recipe has none.
pub fn exclude_hosts_in_job(job: &Element, blacklist: &Blacklist) -> Element {
    let mut result = job.clone();
    if blacklist.is_empty() {
        return result;
    }

    result.for_each_descendant_mut("recipe", &mut |recipe| {
        if recipe.child("hostRequires").is_none() {
            recipe.push(Element::new("hostRequires"));
        }
        if let Some(hreq) = recipe.child_mut("hostRequires") {
            *hreq = exclude_hosts(hreq, blacklist);
        }
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn two_hosts() -> Blacklist {
        let mut blacklist = Blacklist::new();
        blacklist.insert("host1");
        blacklist.insert("host2");
        blacklist
    }

    #[test]
    fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host1\n\nhost2\nhost1").unwrap();

        let blacklist = Blacklist::load(file.path()).unwrap();
        assert_eq!(blacklist.hosts(), ["host1", "host2"]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Blacklist::load(Path::new("blah-such-files-dont-usually-exist")).unwrap_err();
        assert!(err.to_string().starts_with("Can't access"));
    }

    #[test]
    fn test_exclude_without_and() {
        let hreq = Element::parse("<hostRequires></hostRequires>").unwrap();
        let result = exclude_hosts(&hreq, &two_hosts());
        assert_eq!(
            squash(&result.to_xml().unwrap()),
            squash(
                r#"<hostRequires><and>
                <hostname op="!=" value="host1"/>
                <hostname op="!=" value="host2"/></and></hostRequires>"#
            )
        );
    }

    #[test]
    fn test_exclude_empty_blacklist() {
        let initial = r#"<hostRequires><system_type value="Machine"/><and>
        <hypervisor op="=" value=""/></and></hostRequires>"#;
        let hreq = Element::parse(initial).unwrap();
        let result = exclude_hosts(&hreq, &Blacklist::new());
        assert_eq!(squash(&result.to_xml().unwrap()), squash(initial));
    }

    #[test]
    fn test_exclude_appends_to_existing_and() {
        let hreq = Element::parse(
            r#"<hostRequires><system_type value="Machine"/><and>
            <hypervisor op="=" value=""/></and></hostRequires>"#,
        )
        .unwrap();
        let result = exclude_hosts(&hreq, &two_hosts());
        assert_eq!(
            squash(&result.to_xml().unwrap()),
            squash(
                r#"<hostRequires><system_type value="Machine"/><and>
                <hypervisor op="=" value=""/><hostname op="!=" value="host1"/>
                <hostname op="!=" value="host2"/></and></hostRequires>"#
            )
        );
    }

    #[test]
    fn test_exclude_one_constraint_per_host() {
        let hreq = Element::parse(
            r#"<hostRequires><and><hostname op="!=" value="host1"/></and></hostRequires>"#,
        )
        .unwrap();
        let blacklist = two_hosts();
        let result = exclude_hosts(&hreq, &blacklist);

        let before = hreq.descendants("hostname").len();
        let after = result.descendants("hostname").len();
        assert_eq!(after, before + blacklist.len());
        // Not idempotent: a second pass adds the constraints again.
        let twice = exclude_hosts(&result, &blacklist);
        assert_eq!(twice.descendants("hostname").len(), after + blacklist.len());
    }

    #[test]
    fn test_exclude_in_job_covers_every_recipe() {
        let job = Element::parse(
            r#"<job><recipeSet><recipe><hostRequires/></recipe><recipe/></recipeSet></job>"#,
        )
        .unwrap();
        let result = exclude_hosts_in_job(&job, &two_hosts());
        for recipe in result.find_all("recipeSet/recipe") {
            assert_eq!(recipe.find_all("hostRequires/and/hostname").len(), 2);
        }
    }

    #[test]
    fn test_without() {
        assert_eq!(two_hosts().without("host1").hosts(), ["host2"]);
    }
}
