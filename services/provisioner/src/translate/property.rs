//! Platform property strings.
//!
//! Devices are stored as `[positional,]key=value,key=value`, for example
//! `local-lvm:vm-100-disk-0,size=30G` or `virtio=BC:24:11:00:00:01,bridge=vmbr0`.

/// A parsed property string. Entry order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyString {
    positional: Option<String>,
    entries: Vec<(String, String)>,
}

impl PropertyString {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a property string with a positional value.
    pub fn with_positional(value: impl Into<String>) -> Self {
        Self {
            positional: Some(value.into()),
            entries: Vec::new(),
        }
    }

    /// Parses a property string. The first item without `=` is positional;
    /// later bare items are ignored.
    pub fn parse(s: &str) -> Self {
        let mut parsed = Self::default();
        for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            match item.split_once('=') {
                Some((key, value)) => parsed.entries.push((key.to_string(), value.to_string())),
                None if parsed.positional.is_none() => parsed.positional = Some(item.to_string()),
                None => {}
            }
        }
        parsed
    }

    pub fn positional(&self) -> Option<&str> {
        self.positional.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Sets `key`, replacing an existing entry in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Sets `key` only when `value` is present.
    pub fn set_opt<V: ToString>(&mut self, key: &str, value: Option<V>) -> &mut Self {
        if let Some(value) = value {
            self.set(key, value.to_string());
        }
        self
    }
}

impl std::fmt::Display for PropertyString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        if let Some(positional) = &self.positional {
            f.write_str(positional)?;
            first = false;
        }
        for (key, value) in &self.entries {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_disk() {
        let prop = PropertyString::parse("local-lvm:vm-100-disk-0,size=30G,format=raw");
        assert_eq!(prop.positional(), Some("local-lvm:vm-100-disk-0"));
        assert_eq!(prop.get("size"), Some("30G"));
        assert_eq!(prop.get("format"), Some("raw"));
        assert_eq!(prop.get("cache"), None);
    }

    #[test]
    fn test_parse_without_positional() {
        let prop = PropertyString::parse("name=eth0,bridge=vmbr0,ip=dhcp");
        assert_eq!(prop.positional(), None);
        assert_eq!(prop.entries().count(), 3);
    }

    #[test]
    fn test_format_preserves_order() {
        let mut prop = PropertyString::with_positional("local:iso/debian.iso");
        prop.set("media", "cdrom");
        assert_eq!(prop.to_string(), "local:iso/debian.iso,media=cdrom");

        let mut prop = PropertyString::new();
        prop.set("name", "eth0").set("bridge", "vmbr0").set_opt::<String>("gw", None);
        prop.set("name", "eth1");
        assert_eq!(prop.to_string(), "name=eth1,bridge=vmbr0");
    }
}
