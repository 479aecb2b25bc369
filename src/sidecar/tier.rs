use serde::Serialize;

/// The three derivative renditions, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Thumbnail,
    Standard,
    Full,
}

pub const DERIVATIVE_EXTENSION: &str = "jpg";

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Thumbnail, Tier::Standard, Tier::Full];

    pub fn suffix(self) -> &'static str {
        match self {
            Tier::Thumbnail => "thumb",
            Tier::Standard => "standard",
            Tier::Full => "full",
        }
    }

    /// Route segment used by the server. `preview` is an alias of `standard`.
    pub fn route(self) -> &'static str {
        match self {
            Tier::Thumbnail => "thumb",
            Tier::Standard => "standard",
            Tier::Full => "full",
        }
    }

    pub fn from_route(segment: &str) -> Option<Tier> {
        match segment {
            "thumb" => Some(Tier::Thumbnail),
            "preview" | "standard" => Some(Tier::Standard),
            "full" => Some(Tier::Full),
            _ => None,
        }
    }

    /// Derivative file name for a source file name, e.g. `a.jpg.thumb.jpg`.
    pub fn file_name(self, source_name: &str) -> String {
        format!("{}.{}.{}", source_name, self.suffix(), DERIVATIVE_EXTENSION)
    }

    /// Inverse of `file_name`: recover the source name and tier.
    pub fn parse_file_name(derivative_name: &str) -> Option<(String, Tier)> {
        let stem = derivative_name.strip_suffix(&format!(".{}", DERIVATIVE_EXTENSION))?;
        Tier::ALL.iter().find_map(|tier| {
            stem.strip_suffix(&format!(".{}", tier.suffix()))
                .filter(|source| !source.is_empty())
                .map(|source| (source.to_string(), *tier))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_round_trips_through_parse() {
        for tier in Tier::ALL {
            let name = tier.file_name("IMG 001.JPG");
            assert_eq!(Tier::parse_file_name(&name), Some(("IMG 001.JPG".to_string(), tier)));
        }
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert_eq!(Tier::parse_file_name("notes.txt"), None);
        assert_eq!(Tier::parse_file_name("a.jpg"), None);
        assert_eq!(Tier::parse_file_name(".thumb.jpg"), None);
    }

    #[test]
    fn test_route_aliases() {
        assert_eq!(Tier::from_route("preview"), Some(Tier::Standard));
        assert_eq!(Tier::from_route("standard"), Some(Tier::Standard));
        assert_eq!(Tier::from_route("thumb"), Some(Tier::Thumbnail));
        assert_eq!(Tier::from_route("full"), Some(Tier::Full));
        assert_eq!(Tier::from_route("original"), None);
    }
}
