//! Reference points for distance validation: city unit name → centre.
//!
//! A built-in table covers the provincial capitals and other major cities;
//! a JSON file of `{"name": {"lat": .., "lon": ..}}` can add or replace entries.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use super::types::{GeoError, LatLon};

// ─── Built-in dataset ───────────────────────────────────────────

const BUILTIN_CENTERS: &[(&str, f64, f64)] = &[
    ("北京市", 39.9042, 116.4074),
    ("上海市", 31.2304, 121.4737),
    ("天津市", 39.1244, 117.1944),
    ("重庆市", 29.5630, 106.5516),
    ("广州市", 23.1291, 113.2644),
    ("深圳市", 22.5431, 114.0579),
    ("杭州市", 30.2741, 120.1551),
    ("南京市", 32.0603, 118.7969),
    ("苏州市", 31.2989, 120.5853),
    ("无锡市", 31.4912, 120.3119),
    ("宁波市", 29.8683, 121.5440),
    ("温州市", 28.0016, 120.6722),
    ("成都市", 30.5728, 104.0668),
    ("武汉市", 30.5928, 114.3055),
    ("西安市", 34.3416, 108.9398),
    ("南平市", 26.6417, 118.1780),
    ("福州市", 26.0745, 119.2965),
    ("厦门市", 24.4798, 118.0894),
    ("长沙市", 28.2282, 112.9388),
    ("郑州市", 34.7466, 113.6254),
    ("济南市", 36.6512, 117.1209),
    ("青岛市", 36.0671, 120.3826),
    ("沈阳市", 41.8057, 123.4315),
    ("大连市", 38.9140, 121.6147),
    ("哈尔滨市", 45.8038, 126.5340),
    ("长春市", 43.8868, 125.3245),
    ("昆明市", 25.0406, 102.7129),
    ("贵阳市", 26.6470, 106.6302),
    ("南昌市", 28.6829, 115.8579),
    ("合肥市", 31.8206, 117.2272),
    ("石家庄市", 38.0428, 114.5149),
    ("太原市", 37.8706, 112.5489),
    ("兰州市", 36.0611, 103.8343),
    ("西宁市", 36.6171, 101.7782),
    ("银川市", 38.4681, 106.2731),
    ("乌鲁木齐市", 43.8256, 87.6168),
    ("拉萨市", 29.6470, 91.1145),
    ("呼和浩特市", 40.8416, 111.7519),
    ("南宁市", 22.8170, 108.3665),
    ("海口市", 20.0444, 110.1999),
];

/// Lookup table of reference points keyed by administrative unit name.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTable {
    points: HashMap<String, LatLon>,
}

impl ReferenceTable {
    /// The built-in city centres.
    pub fn builtin() -> Self {
        let points = BUILTIN_CENTERS
            .iter()
            .filter_map(|&(name, lat, lon)| LatLon::new(lat, lon).map(|p| (name.to_string(), p)))
            .collect();
        Self { points }
    }

    /// Load a table from a JSON file. Out-of-range points are skipped.
    pub fn from_json_file(path: &Path) -> Result<Self, GeoError> {
        let data = fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, GeoError> {
        let raw: HashMap<String, LatLon> = serde_json::from_str(data)?;
        let mut points = HashMap::with_capacity(raw.len());
        for (name, p) in raw {
            match LatLon::new(p.lat, p.lon) {
                Some(point) => {
                    points.insert(name, point);
                }
                None => tracing::warn!(name = %name, lat = p.lat, lon = p.lon, "skipping out-of-range reference point"),
            }
        }
        Ok(Self { points })
    }

    /// Entries from `other` replace entries with the same name.
    pub fn merge(&mut self, other: ReferenceTable) {
        self.points.extend(other.points);
    }

    /// Exact lookup, then with a trailing 市 ("杭州" → "杭州市").
    pub fn get(&self, name: &str) -> Option<LatLon> {
        if let Some(p) = self.points.get(name) {
            return Some(*p);
        }
        if name.ends_with('市') {
            return None;
        }
        self.points.get(&format!("{}市", name)).copied()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_lookup() {
        let table = ReferenceTable::builtin();
        let p = table.get("杭州市").unwrap();
        assert!((p.lat - 30.2741).abs() < 1e-6);
        assert!(table.len() >= 40);
    }

    #[test]
    fn test_lookup_without_suffix() {
        let table = ReferenceTable::builtin();
        assert_eq!(table.get("杭州"), table.get("杭州市"));
        assert!(table.get("西城区").is_none());
    }

    #[test]
    fn test_json_file_merge_overrides_builtin() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("refs.json");
        fs::write(
            &path,
            r#"{
                "杭州市": {"lat": 30.0, "lon": 120.0},
                "绍兴市": {"lat": 30.0303, "lon": 120.5802},
                "月球": {"lat": 123.0, "lon": 0.0}
            }"#,
        )
        .unwrap();

        let mut table = ReferenceTable::builtin();
        let before = table.len();
        table.merge(ReferenceTable::from_json_file(&path).unwrap());

        assert_eq!(table.len(), before + 1);
        assert_eq!(table.get("杭州市").unwrap().lat, 30.0);
        assert!(table.get("绍兴市").is_some());
        assert!(table.get("月球").is_none());
    }

    #[test]
    fn test_bad_json_is_error() {
        assert!(ReferenceTable::from_json_str("not json").is_err());
    }
}
