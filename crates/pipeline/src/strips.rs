//! ArcticDEM strip selection and download lists
//!
//! Strips from the index that overlap a buffered scene envelope are ranked
//! by overlap area, then by acquisition date, and the best ones are written
//! out as URL lists plus a shell script that downloads, unpacks and mosaics
//! them with `gdalbuildvrt`.

use crate::config::{DemResolution, StripSelectionConfig};
use crate::error::{PipelineError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use geo::{Intersects, MapCoords};
use geo_types::{Coord, Geometry};
use lakemap_algorithms::vector::intersection_area;
use lakemap_core::crs::Transformer;
use lakemap_core::io::read_geojson;
use lakemap_core::vector::{AttributeValue, Feature, FeatureCollection};
use lakemap_core::{Bounds, CRS};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const URL_COLUMNS: &[&str] = &["fileurl", "url", "downloadurl", "dem_url", "FILEURL", "FileURL", "file_url", "href"];
const ID_COLUMNS: &[&str] = &["tile", "strip", "name", "dem_id", "strip_id", "ProductID"];
const DATE_COLUMNS: &[&str] = &[
    "acqdate",
    "acq_date",
    "acquisition_da",
    "acquisition",
    "date",
    "ACQDATE",
    "Date",
    "DATE",
];

/// A strip chosen for download
#[derive(Debug, Clone, PartialEq)]
pub struct Strip {
    pub id: String,
    pub url: String,
    pub acquired: Option<NaiveDateTime>,
    /// Overlap with the buffered scene envelope, in squared CRS units
    pub intersect_area: f64,
}

/// Ranked strips with the index columns they were read from
#[derive(Debug, Clone)]
pub struct StripSelection {
    /// Strips overlapping the envelope before ranking
    pub overlapping: usize,
    pub strips: Vec<Strip>,
    pub url_column: String,
    pub id_column: String,
    pub date_column: Option<String>,
}

/// Files written by [`write_download_lists`]
#[derive(Debug, Clone)]
pub struct DownloadLists {
    pub raw: PathBuf,
    pub urls_2m: PathBuf,
    pub urls_10m: PathBuf,
    pub csv: PathBuf,
    pub chosen: PathBuf,
    pub fetch_script: PathBuf,
}

fn has_column(fc: &FeatureCollection, key: &str) -> bool {
    fc.iter().any(|f| f.properties.contains_key(key))
}

pub fn detect_url_column(fc: &FeatureCollection) -> Result<String> {
    if let Some(c) = URL_COLUMNS.iter().find(|c| has_column(fc, c)) {
        return Ok(c.to_string());
    }
    let keys = fc.property_keys();
    keys.iter()
        .find(|k| {
            fc.iter()
                .filter_map(|f| f.get_property(k))
                .any(|v| v.to_string().starts_with("http"))
        })
        .cloned()
        .ok_or_else(|| PipelineError::NoUrlColumn(keys.join(", ")))
}

pub fn detect_id_column(fc: &FeatureCollection) -> Option<String> {
    ID_COLUMNS
        .iter()
        .find(|c| has_column(fc, c))
        .map(|c| c.to_string())
        .or_else(|| fc.property_keys().into_iter().next())
}

pub fn detect_date_column(fc: &FeatureCollection) -> Option<String> {
    if let Some(c) = DATE_COLUMNS.iter().find(|c| has_column(fc, c)) {
        return Some(c.to_string());
    }
    fc.property_keys().into_iter().find(|k| {
        let k = k.to_lowercase();
        k.contains("date") || k.contains("acq")
    })
}

/// Lenient date parsing; `None` when nothing fits
pub fn parse_date(value: &AttributeValue) -> Option<NaiveDateTime> {
    let s = match value {
        AttributeValue::String(s) => s.trim().to_string(),
        AttributeValue::Int(i) => i.to_string(),
        _ => return None,
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&s, fmt) {
            return Some(dt);
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y%m%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(&s, fmt) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

/// Switch a strip URL between its 2 m and 10 m variants
pub fn rewrite_resolution(url: &str, target: DemResolution) -> String {
    let to = target.token();
    let from = target.other().token();
    url.replace(&format!("/{from}/"), &format!("/{to}/"))
        .replace(&format!("_{from}_"), &format!("_{to}_"))
}

fn reprojected(geometry: &Geometry<f64>, tr: &Transformer) -> Geometry<f64> {
    if tr.is_identity() {
        return geometry.clone();
    }
    geometry.map_coords(|c| {
        let (x, y) = tr.transform(c.x, c.y);
        Coord { x, y }
    })
}

fn attribute_string(feature: &Feature, key: &str) -> Option<String> {
    match feature.get_property(key)? {
        AttributeValue::Null => None,
        v => Some(v.to_string()),
    }
}

/// Rank the index strips overlapping `bounds` (in `crs`) buffered by
/// `cfg.buffer_m`.
pub fn select_strips(index: &FeatureCollection, bounds: &Bounds, crs: &CRS, cfg: &StripSelectionConfig) -> Result<StripSelection> {
    let aoi = bounds.buffer(cfg.buffer_m);
    let aoi_poly = aoi.to_polygon();
    let tr = Transformer::between(index.crs.as_ref(), Some(crs))?;

    let overlapping: Vec<(&Feature, f64)> = index
        .iter()
        .filter_map(|f| {
            let g = reprojected(f.geometry.as_ref()?, &tr);
            g.intersects(&aoi_poly).then(|| (f, intersection_area(&g, &aoi)))
        })
        .collect();
    info!("found {} overlapping DEM strips", overlapping.len());
    if overlapping.is_empty() {
        return Err(PipelineError::NoOverlappingStrips);
    }

    let n_overlapping = overlapping.len();
    let positive: Vec<(&Feature, f64)> = overlapping.into_iter().filter(|(_, a)| *a > 0.0).collect();
    if positive.is_empty() {
        return Err(PipelineError::ZeroIntersectionArea);
    }

    // columns are detected on the selection, not the whole index
    let mut selected = FeatureCollection::new(index.crs.clone());
    for (f, _) in &positive {
        selected.push((*f).clone());
    }
    let url_column = detect_url_column(&selected)?;
    let id_column = detect_id_column(&selected).unwrap_or_else(|| url_column.clone());
    let date_column = detect_date_column(&selected);
    debug!(url = %url_column, id = %id_column, date = ?date_column, "strip index columns");

    let mut strips: Vec<Strip> = positive
        .into_iter()
        .filter_map(|(f, area)| {
            Some(Strip {
                id: attribute_string(f, &id_column).unwrap_or_default(),
                url: attribute_string(f, &url_column)?,
                acquired: date_column.as_deref().and_then(|c| f.get_property(c)).and_then(parse_date),
                intersect_area: area,
            })
        })
        .collect();

    strips.sort_by(|a, b| {
        b.intersect_area
            .partial_cmp(&a.intersect_area)
            .unwrap_or(Ordering::Equal)
            .then_with(|| match (a.acquired, b.acquired) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });
    let keep = cfg.max_strips.max(1);
    strips.truncate(keep);
    info!("selected top {} strips (max-strips={keep}) after ranking", strips.len());
    for s in &strips {
        debug!(id = %s.id, area = s.intersect_area, acquired = ?s.acquired, "strip");
    }

    Ok(StripSelection {
        overlapping: n_overlapping,
        strips,
        url_column,
        id_column,
        date_column,
    })
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut text = lines.join("\n");
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

/// Write the URL lists, the id/url CSV and the fetch script into `out_dir`
pub fn write_download_lists(selection: &StripSelection, out_dir: &Path, resolution: DemResolution) -> Result<DownloadLists> {
    std::fs::create_dir_all(out_dir)?;

    let mut raw: Vec<String> = Vec::new();
    for s in &selection.strips {
        if !raw.contains(&s.url) {
            raw.push(s.url.clone());
        }
    }
    let urls_2m: Vec<String> = raw.iter().map(|u| rewrite_resolution(u, DemResolution::TwoMetre)).collect();
    let urls_10m: Vec<String> = raw.iter().map(|u| rewrite_resolution(u, DemResolution::TenMetre)).collect();

    let lists = DownloadLists {
        raw: out_dir.join("dem_urls_raw.txt"),
        urls_2m: out_dir.join("dem_urls_2m.txt"),
        urls_10m: out_dir.join("dem_urls_10m.txt"),
        csv: out_dir.join("dem_urls.csv"),
        chosen: out_dir.join("dem_urls.txt"),
        fetch_script: out_dir.join("fetch-dem.sh"),
    };
    write_lines(&lists.raw, &raw)?;
    write_lines(&lists.urls_2m, &urls_2m)?;
    write_lines(&lists.urls_10m, &urls_10m)?;

    let mut wtr = csv::Writer::from_path(&lists.csv)?;
    wtr.write_record([selection.id_column.as_str(), selection.url_column.as_str()])?;
    let mut seen: Vec<(&str, &str)> = Vec::new();
    for s in &selection.strips {
        let row = (s.id.as_str(), s.url.as_str());
        if !seen.contains(&row) {
            wtr.write_record([row.0, row.1])?;
            seen.push(row);
        }
    }
    wtr.flush()?;

    let chosen = match resolution {
        DemResolution::TwoMetre => &urls_2m,
        DemResolution::TenMetre => &urls_10m,
    };
    write_lines(&lists.chosen, chosen)?;
    info!("chosen resolution: {resolution} -> {}", lists.chosen.display());

    write_fetch_script(
        &lists.fetch_script,
        &lists.chosen,
        &out_dir.join("tiles"),
        &out_dir.join("arcticdem_mosaic.vrt"),
        resolution,
    )?;
    Ok(lists)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |d| d.join(path))
}

/// Bash script that downloads every URL (resuming partial files), falls
/// back to the other resolution on failure, unpacks the archives, keeps
/// only `*_dem.tif` and builds a VRT over them.
pub fn write_fetch_script(
    script: &Path,
    urls_txt: &Path,
    tiles_dir: &Path,
    vrt: &Path,
    resolution: DemResolution,
) -> Result<()> {
    let from = resolution.token();
    let to = resolution.other().token();
    let body = format!(
        r#"#!/bin/bash
set -euo pipefail

URLS="{urls}"
TILES="{tiles}"
VRT="{vrt}"

mkdir -p "$TILES"
cd "$TILES"

echo "==> Downloading ArcticDEM archives from $URLS"
while IFS= read -r url; do
  [[ -z "$url" ]] && continue

  fname="$(basename "$url")"
  echo "-> $fname"

  if ! command curl --no-remote-header-name -C - -fL --progress-bar -o "$fname" "$url"; then
    alt="${{url/\/{from}\//\/{to}/}}"
    alt="${{alt/_{from}_/_{to}_}}"
    alt_fname="$(basename "$alt")"
    echo "   {from} failed. Trying {to}: $alt_fname"
    if ! command curl --no-remote-header-name -C - -fL --progress-bar -o "$alt_fname" "$alt"; then
      echo "   failed both {from} and {to} for: $url"
      continue
    fi
    fname="$alt_fname"
  fi

  echo "   extracting $fname"
  tar -xzvf "$fname"
  rm -f "$fname"
done < "$URLS"

echo "==> Keeping only DEM GeoTIFFs"
find "$TILES" -type f -name "*.tif" ! -name "*_dem.tif" -delete

echo "==> Building VRT"
gdalbuildvrt -overwrite "$VRT" "$TILES"/*_dem.tif

echo "Done. VRT at: $VRT"
"#,
        urls = absolute(urls_txt).display(),
        tiles = absolute(tiles_dir).display(),
        vrt = absolute(vrt).display(),
    );
    std::fs::write(script, body)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(script, std::fs::Permissions::from_mode(0o755))?;
    }
    info!("fetch script ready: {}", script.display());
    Ok(())
}

/// Read the strip index, select strips and write the download lists
pub fn prepare_dem_downloads(
    index_path: &Path,
    sentinel_bounds: &Bounds,
    out_dir: &Path,
    cfg: &StripSelectionConfig,
) -> Result<(StripSelection, DownloadLists)> {
    let index = read_geojson(index_path)?;
    let selection = select_strips(&index, sentinel_bounds, &cfg.crs()?, cfg)?;
    let lists = write_download_lists(&selection, out_dir, cfg.resolution)?;
    Ok((selection, lists))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn strip(x0: f64, y0: f64, side: f64, name: &str, url: &str, date: &str) -> Feature {
        Feature::new(Bounds::new(x0, y0, x0 + side, y0 + side).to_polygon().into())
            .with_property("name", name)
            .with_property("fileurl", url)
            .with_property("acqdate", date)
    }

    fn index() -> FeatureCollection {
        let mut fc = FeatureCollection::new(Some(CRS::from_epsg(32622)));
        fc.push(strip(0.0, 0.0, 1000.0, "small", "https://pgc/10m/a_10m_v4.1.tar.gz", "2019-06-01"));
        fc.push(strip(-500.0, -500.0, 5000.0, "big_old", "https://pgc/10m/b_10m_v4.1.tar.gz", "2015-06-01"));
        fc.push(strip(-500.0, -500.0, 5000.0, "big_new", "https://pgc/10m/c_10m_v4.1.tar.gz", "2020-06-01"));
        fc.push(strip(90_000.0, 0.0, 100.0, "far", "https://pgc/10m/d_10m_v4.1.tar.gz", "2021-01-01"));
        fc
    }

    fn cfg(max: usize) -> StripSelectionConfig {
        StripSelectionConfig {
            buffer_m: 100.0,
            max_strips: max,
            ..Default::default()
        }
    }

    #[test]
    fn ranks_by_area_then_date() {
        let sel = select_strips(&index(), &Bounds::new(0.0, 0.0, 4000.0, 4000.0), &CRS::from_epsg(32622), &cfg(10)).unwrap();
        assert_eq!(sel.overlapping, 3);
        let ids: Vec<_> = sel.strips.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["big_new", "big_old", "small"]);
        // AOI is (-100, -100)..(4100, 4100)
        assert_relative_eq!(sel.strips[0].intersect_area, 4200.0 * 4200.0, max_relative = 1e-9);
        assert_eq!(sel.url_column, "fileurl");
        assert_eq!(sel.id_column, "name");
        assert_eq!(sel.date_column.as_deref(), Some("acqdate"));
    }

    #[test]
    fn keeps_at_least_one() {
        let sel = select_strips(&index(), &Bounds::new(0.0, 0.0, 4000.0, 4000.0), &CRS::from_epsg(32622), &cfg(0)).unwrap();
        assert_eq!(sel.strips.len(), 1);
    }

    #[test]
    fn no_overlap_errors() {
        let err = select_strips(&index(), &Bounds::new(500_000.0, 0.0, 501_000.0, 1000.0), &CRS::from_epsg(32622), &cfg(10))
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoOverlappingStrips));
    }

    #[test]
    fn url_column_fallback() {
        let mut fc = FeatureCollection::new(None);
        fc.push(Feature::default().with_property("location", "https://example.org/x.tar.gz").with_property("id", 1i64));
        assert_eq!(detect_url_column(&fc).unwrap(), "location");

        let mut bare = FeatureCollection::new(None);
        bare.push(Feature::default().with_property("id", 1i64));
        assert!(matches!(detect_url_column(&bare), Err(PipelineError::NoUrlColumn(_))));
    }

    #[test]
    fn columns_come_from_overlapping_strips() {
        let mut fc = FeatureCollection::new(Some(CRS::from_epsg(32622)));
        // across the whole index `alt` would be the first column holding a URL
        fc.push(
            Feature::new(Bounds::new(90_000.0, 0.0, 91_000.0, 1000.0).to_polygon().into())
                .with_property("id", "far")
                .with_property("alt", "https://mirror/far.tar.gz")
                .with_property("link", "none"),
        );
        fc.push(
            Feature::new(Bounds::new(0.0, 0.0, 1000.0, 1000.0).to_polygon().into())
                .with_property("id", "near")
                .with_property("link", "https://pgc/10m/near_10m_v4.1.tar.gz"),
        );
        let sel = select_strips(&fc, &Bounds::new(0.0, 0.0, 1000.0, 1000.0), &CRS::from_epsg(32622), &cfg(10)).unwrap();
        assert_eq!(sel.url_column, "link");
        assert_eq!(sel.strips.len(), 1);
        assert_eq!(sel.strips[0].url, "https://pgc/10m/near_10m_v4.1.tar.gz");
    }

    #[test]
    fn date_formats() {
        let d = |s: &str| parse_date(&AttributeValue::from(s));
        assert!(d("2019-07-15").is_some());
        assert!(d("2019/07/15").is_some());
        assert!(d("2019-07-15T14:30:00Z").is_some());
        assert!(d("2019-07-15 14:30:00").is_some());
        assert_eq!(parse_date(&AttributeValue::Int(20190715)), d("2019-07-15"));
        assert!(d("not a date").is_none());
    }

    #[test]
    fn resolution_rewrite() {
        let u = "https://data.pgc.umn.edu/elev/dem/setsm/ArcticDEM/strips/s2s041/10m/n69w050/SETSM_s2s041_WV01_20190601_10m_lsf_seg1.tar.gz";
        let two = rewrite_resolution(u, DemResolution::TwoMetre);
        assert!(two.contains("/2m/") && two.contains("_2m_"));
        assert_eq!(rewrite_resolution(&two, DemResolution::TenMetre), u);
        assert_eq!(rewrite_resolution(u, DemResolution::TenMetre), u);
    }

    #[test]
    fn writes_lists_and_script() {
        let tmp = tempfile::tempdir().unwrap();
        let sel = select_strips(&index(), &Bounds::new(0.0, 0.0, 4000.0, 4000.0), &CRS::from_epsg(32622), &cfg(2)).unwrap();
        let lists = write_download_lists(&sel, tmp.path(), DemResolution::TwoMetre).unwrap();

        let chosen = std::fs::read_to_string(&lists.chosen).unwrap();
        assert_eq!(chosen.lines().count(), 2);
        assert!(chosen.lines().all(|l| l.contains("/2m/")));
        let raw = std::fs::read_to_string(&lists.raw).unwrap();
        assert!(raw.starts_with("https://pgc/10m/c_10m"));

        let mut rdr = csv::Reader::from_path(&lists.csv).unwrap();
        assert_eq!(rdr.headers().unwrap(), vec!["name", "fileurl"]);
        assert_eq!(rdr.records().count(), 2);

        let script = std::fs::read_to_string(&lists.fetch_script).unwrap();
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains("gdalbuildvrt -overwrite"));
        assert!(script.contains(r#"alt="${url/\/2m\//\/10m/}""#));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&lists.fetch_script).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
