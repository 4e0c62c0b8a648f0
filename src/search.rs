use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    engine::Services,
    state::{AppError, AppResult},
    store::{files, segments, Digest, Modality, SegmentKind},
};

/// A search request. Media legs are file paths (the engine surfaces a
/// bytes-based API and stages the bytes into temp files) so the query
/// serializes cleanly into a task target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub image_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub k: usize,
    /// Restrict results to these file modalities.
    pub modalities: Option<Vec<Modality>>,
    /// Keep only hits whose span overlaps this range.
    pub time_range: Option<(f64, f64)>,
    /// Keep only files with at least one path under these roots.
    pub directories: Option<Vec<PathBuf>>,
}

impl SearchQuery {
    #[cfg(test)]
    pub fn text(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: Some(text.into()),
            k,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.image_path.is_none() && self.audio_path.is_none()
    }
}

/// A vector-store hit joined with its authoritative metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedHit {
    pub digest: Digest,
    pub file_id: i64,
    pub file_modality: Modality,
    pub segment: Option<(SegmentKind, i64)>,
    pub span: Option<(f64, f64)>,
    pub paths: Vec<String>,
    pub score: f32,
    /// Which query leg produced the hit.
    pub query_modality: Modality,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RetrievedSet {
    pub hits: Vec<EnrichedHit>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub digest: String,
    pub file_id: i64,
    pub modality: Modality,
    pub paths: Vec<String>,
    pub segment: Option<(SegmentKind, i64)>,
    pub start_s: Option<f64>,
    pub end_s: Option<f64>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub segment_id: i64,
    pub start_s: f64,
    pub end_s: f64,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTimeline {
    pub digest: String,
    pub paths: Vec<String>,
    pub time_order: Vec<TimelineEntry>,
    pub relevance_order: Vec<TimelineEntry>,
    pub total_relevant_s: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub timeline: Option<Vec<VideoTimeline>>,
    pub warnings: Vec<String>,
}

/// Full synchronous pipeline: encode, retrieve, enrich, filter, fuse,
/// assemble the timeline, trim to k.
pub fn run(services: &Services, query: &SearchQuery) -> AppResult<SearchResponse> {
    let retrieved = retrieve(services, query)?;
    let filtered = filter_hits(retrieved.hits, query);
    let results = fuse(services, filtered);
    let timeline = assemble_timeline(&results);
    let mut results = results;
    results.truncate(query.k);
    Ok(SearchResponse {
        results,
        timeline,
        warnings: retrieved.warnings,
    })
}

/// Encodes each provided query leg (in parallel) and pulls the over-fetched
/// candidate set from the matching collections. One failing leg degrades to
/// a warning as long as another leg succeeds.
pub fn retrieve(services: &Services, query: &SearchQuery) -> AppResult<RetrievedSet> {
    if query.is_empty() {
        return Ok(RetrievedSet::default());
    }

    let embedder = &services.embedder;
    let preprocessor = &services.preprocessor;

    let (text_vec, image_vec, audio_vec) = std::thread::scope(|scope| {
        let text = query
            .text
            .as_deref()
            .map(|text| scope.spawn(move || embedder.embed_text(text)));
        let image = query.image_path.as_deref().map(|path| {
            scope.spawn(move || {
                let image = preprocessor.decode_image(path)?;
                embedder.embed_image(&image)
            })
        });
        let audio = query.audio_path.as_deref().map(|path| {
            scope.spawn(move || {
                let waveform = preprocessor.load_audio(path)?;
                embedder.embed_audio(&waveform)
            })
        });

        fn join<'scope, T>(
            handle: Option<std::thread::ScopedJoinHandle<'scope, T>>,
        ) -> Option<T> {
            handle.map(|h| h.join().expect("query encode thread panicked"))
        }
        (join(text), join(image), join(audio))
    });

    let mut warnings = Vec::new();
    let mut legs: Vec<(Modality, Vec<f32>, Vec<Modality>)> = Vec::new();
    let mut first_error = None;

    let mut push_leg = |modality: Modality,
                        encoded: Option<AppResult<Vec<f32>>>,
                        collections: Vec<Modality>,
                        warnings: &mut Vec<String>,
                        first_error: &mut Option<AppError>| {
        match encoded {
            Some(Ok(vector)) => legs.push((modality, vector, collections)),
            Some(Err(e)) => {
                warn!("query {} leg failed: {e}", modality.name());
                warnings.push(format!("{} query failed: {e}", modality.name()));
                if first_error.is_none() {
                    *first_error = Some(e);
                }
            }
            None => {}
        }
    };

    push_leg(
        Modality::Text,
        text_vec,
        vec![Modality::Text, Modality::Image, Modality::Video],
        &mut warnings,
        &mut first_error,
    );
    push_leg(
        Modality::Image,
        image_vec,
        vec![Modality::Image, Modality::Video],
        &mut warnings,
        &mut first_error,
    );
    push_leg(
        Modality::Audio,
        audio_vec,
        vec![Modality::Audio],
        &mut warnings,
        &mut first_error,
    );

    if legs.is_empty() {
        // Every provided leg failed; that is a hard error, not degradation.
        return Err(first_error.expect("a failed leg recorded its error"));
    }

    let over_k = ((query.k as f64) * services.config.search.over_fetch).ceil() as usize;
    let mut conn = services.db.get()?;
    let mut hits = Vec::new();

    for (query_modality, vector, collections) in legs {
        for collection_modality in collections {
            let collection = match services.vectors.collection(collection_modality) {
                Ok(c) => c,
                Err(e) => {
                    warnings.push(format!(
                        "collection {} unavailable: {e}",
                        collection_modality.name()
                    ));
                    continue;
                }
            };
            let raw = match collection.search(&vector, over_k, None) {
                Ok(raw) => raw,
                Err(e) => {
                    warnings.push(format!(
                        "search in {} failed: {e}",
                        collection_modality.name()
                    ));
                    continue;
                }
            };

            for hit in raw {
                let Some(binding) =
                    segments::binding_for(&mut conn, collection_modality, hit.id)?
                else {
                    debug!(
                        "vector {} in {} has no binding yet, skipping",
                        hit.id,
                        collection_modality.name()
                    );
                    continue;
                };
                let Ok(file) = files::file_row(&mut conn, binding.file_id) else {
                    continue;
                };
                let paths = files::paths_for(&mut conn, file.id)?;
                if paths.is_empty() {
                    continue;
                }
                hits.push(EnrichedHit {
                    digest: file.digest,
                    file_id: file.id,
                    file_modality: file.modality,
                    segment: binding.segment,
                    span: binding.span,
                    paths,
                    score: hit.score,
                    query_modality,
                });
            }
        }
    }

    Ok(RetrievedSet { hits, warnings })
}

/// Applies the query's modality, time-range and directory restrictions.
pub fn filter_hits(hits: Vec<EnrichedHit>, query: &SearchQuery) -> Vec<EnrichedHit> {
    hits.into_iter()
        .filter(|hit| {
            if let Some(modalities) = &query.modalities {
                if !modalities.contains(&hit.file_modality) {
                    return false;
                }
            }
            if let Some((from, to)) = query.time_range {
                match hit.span {
                    Some((start, end)) => {
                        if end < from || start > to {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            if let Some(dirs) = &query.directories {
                let under = hit.paths.iter().any(|p| {
                    let path = Path::new(p);
                    dirs.iter().any(|dir| path.starts_with(dir))
                });
                if !under {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Cross-modal fusion: per-leg min-max normalization over the over-fetched
/// set, then a weighted sum keyed by `(digest, segment)`. One file with
/// many paths collapses into a single result carrying all of them.
pub fn fuse(services: &Services, hits: Vec<EnrichedHit>) -> Vec<SearchResult> {
    if hits.is_empty() {
        return Vec::new();
    }

    // Min-max bounds per query leg; only multi-modal fusion normalizes.
    // A single-leg query keeps its raw [0, 1] cosine scores (weight 1.0).
    let mut bounds: HashMap<Modality, (f32, f32)> = HashMap::new();
    for hit in &hits {
        let entry = bounds
            .entry(hit.query_modality)
            .or_insert((f32::MAX, f32::MIN));
        entry.0 = entry.0.min(hit.score);
        entry.1 = entry.1.max(hit.score);
    }
    let multimodal = bounds.len() > 1;

    let weights = &services.config.search.fusion;
    let leg_weight = |modality: Modality| -> f64 {
        match modality {
            Modality::Text => weights.text,
            Modality::Image => weights.image,
            Modality::Audio => weights.audio,
            Modality::Video => 0.0,
        }
    };
    let present: Vec<Modality> = bounds.keys().copied().collect();
    let weight_sum: f64 = if multimodal {
        present.iter().map(|m| leg_weight(*m)).sum()
    } else {
        1.0
    };

    // Best normalized score per (key, leg).
    #[derive(Default)]
    struct Fused {
        per_leg: HashMap<Modality, f32>,
        exemplar: Option<EnrichedHit>,
    }
    let mut groups: HashMap<(Digest, Option<(SegmentKind, i64)>), Fused> = HashMap::new();

    for hit in hits {
        let (min, max) = bounds[&hit.query_modality];
        let normalized = if !multimodal {
            hit.score
        } else if (max - min).abs() < f32::EPSILON {
            1.0
        } else {
            (hit.score - min) / (max - min)
        };

        let fused = groups.entry((hit.digest, hit.segment)).or_default();
        let slot = fused.per_leg.entry(hit.query_modality).or_insert(0.0);
        *slot = slot.max(normalized);
        let replace = match &fused.exemplar {
            Some(existing) => hit.score > existing.score,
            None => true,
        };
        if replace {
            fused.exemplar = Some(hit);
        }
    }

    let mut results: Vec<SearchResult> = groups
        .into_values()
        .filter_map(|fused| {
            let exemplar = fused.exemplar?;
            let combined: f64 = if !multimodal {
                *fused.per_leg.values().next().expect("one entry") as f64
            } else {
                fused
                    .per_leg
                    .iter()
                    .map(|(leg, score)| leg_weight(*leg) * *score as f64)
                    .sum::<f64>()
                    / weight_sum.max(f64::EPSILON)
            };
            Some(SearchResult {
                digest: exemplar.digest.to_hex(),
                file_id: exemplar.file_id,
                modality: exemplar.file_modality,
                paths: exemplar.paths,
                segment: exemplar.segment,
                start_s: exemplar.span.map(|(s, _)| s),
                end_s: exemplar.span.map(|(_, e)| e),
                score: combined as f32,
            })
        })
        .collect();

    results.sort_unstable_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.file_id.cmp(&b.file_id))
    });
    results
}

/// Groups video hits by parent file and emits both orderings plus the
/// total relevant duration per video.
pub fn assemble_timeline(results: &[SearchResult]) -> Option<Vec<VideoTimeline>> {
    let video_hits: Vec<&SearchResult> = results
        .iter()
        .filter(|r| r.modality == Modality::Video && r.start_s.is_some())
        .collect();
    if video_hits.is_empty() {
        return None;
    }

    let timelines = video_hits
        .into_iter()
        .into_group_map_by(|r| r.digest.clone())
        .into_iter()
        .map(|(digest, hits)| {
            let entries: Vec<TimelineEntry> = hits
                .iter()
                .map(|hit| TimelineEntry {
                    segment_id: hit.segment.map(|(_, id)| id).unwrap_or_default(),
                    start_s: hit.start_s.unwrap_or_default(),
                    end_s: hit.end_s.unwrap_or_default(),
                    score: hit.score,
                })
                .collect();

            let mut time_order = entries.clone();
            time_order.sort_unstable_by(|a, b| {
                a.start_s
                    .partial_cmp(&b.start_s)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let mut relevance_order = entries;
            relevance_order.sort_unstable_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let total_relevant_s = time_order
                .iter()
                .map(|e| e.end_s - e.start_s)
                .sum();

            VideoTimeline {
                digest,
                paths: hits
                    .first()
                    .map(|h| h.paths.clone())
                    .unwrap_or_default(),
                time_order,
                relevance_order,
                total_relevant_s,
            }
        })
        .collect();

    Some(timelines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(
        digest_tag: u8,
        segment: Option<(SegmentKind, i64)>,
        score: f32,
        query_modality: Modality,
    ) -> EnrichedHit {
        EnrichedHit {
            digest: Digest([digest_tag; 32]),
            file_id: digest_tag as i64,
            file_modality: Modality::Image,
            segment,
            span: segment.map(|(_, id)| (id as f64, id as f64 + 5.0)),
            paths: vec![format!("/tree/{digest_tag}.jpg")],
            score,
            query_modality,
        }
    }

    fn services() -> (tempfile::TempDir, Services) {
        crate::engine::test_services()
    }

    #[test]
    fn fuse_dedupes_by_digest_and_segment() {
        let (_dir, services) = services();

        let hits = vec![
            hit(1, None, 0.9, Modality::Text),
            hit(1, None, 0.7, Modality::Text),
            hit(2, None, 0.5, Modality::Text),
        ];
        let results = fuse(&services, hits);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file_id, 1);
        // Scores are monotonically non-increasing (top-k contract).
        assert!(results[0].score >= results[1].score);
    }

    #[test]
    fn single_leg_keeps_raw_scores() {
        let (_dir, services) = services();

        let results = fuse(
            &services,
            vec![
                hit(1, None, 0.9, Modality::Text),
                hit(2, None, 0.1, Modality::Text),
            ],
        );
        // Single-leg queries skip min-max normalization, so the weaker hit
        // keeps a non-zero score.
        assert!((results[0].score - 0.9).abs() < 1e-6);
        assert!((results[1].score - 0.1).abs() < 1e-6);
    }

    #[test]
    fn multimodal_fusion_weights_legs() {
        let (_dir, services) = services();

        // File 1 wins the text leg, file 2 wins the image leg; text weight
        // (0.5) beats image weight (0.3).
        let hits = vec![
            hit(1, None, 0.9, Modality::Text),
            hit(2, None, 0.2, Modality::Text),
            hit(2, None, 0.9, Modality::Image),
            hit(1, None, 0.2, Modality::Image),
        ];
        let results = fuse(&services, hits);
        assert_eq!(results[0].file_id, 1);
        assert_eq!(results[1].file_id, 2);
    }

    #[test]
    fn filters_apply_modality_time_and_directory() {
        let mut video_hit = hit(1, Some((SegmentKind::Video, 10)), 0.8, Modality::Text);
        video_hit.file_modality = Modality::Video;
        let image_hit = hit(2, None, 0.9, Modality::Text);

        let query = SearchQuery {
            text: Some("x".into()),
            k: 10,
            modalities: Some(vec![Modality::Video]),
            ..SearchQuery::default()
        };
        let out = filter_hits(vec![video_hit.clone(), image_hit.clone()], &query);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].file_id, 1);

        // Segment spans [10, 15): a range ending before it excludes it.
        let query = SearchQuery {
            text: Some("x".into()),
            k: 10,
            time_range: Some((0.0, 5.0)),
            ..SearchQuery::default()
        };
        assert!(filter_hits(vec![video_hit.clone()], &query).is_empty());
        let query = SearchQuery {
            text: Some("x".into()),
            k: 10,
            time_range: Some((12.0, 20.0)),
            ..SearchQuery::default()
        };
        assert_eq!(filter_hits(vec![video_hit.clone()], &query).len(), 1);

        let query = SearchQuery {
            text: Some("x".into()),
            k: 10,
            directories: Some(vec![PathBuf::from("/other")]),
            ..SearchQuery::default()
        };
        assert!(filter_hits(vec![image_hit], &query).is_empty());
    }

    #[test]
    fn timeline_groups_by_video_and_sums_duration() {
        let results = vec![
            SearchResult {
                digest: "aa".into(),
                file_id: 1,
                modality: Modality::Video,
                paths: vec!["/v.mp4".into()],
                segment: Some((SegmentKind::Video, 2)),
                start_s: Some(20.0),
                end_s: Some(25.0),
                score: 0.4,
            },
            SearchResult {
                digest: "aa".into(),
                file_id: 1,
                modality: Modality::Video,
                paths: vec!["/v.mp4".into()],
                segment: Some((SegmentKind::Video, 1)),
                start_s: Some(0.0),
                end_s: Some(5.0),
                score: 0.9,
            },
        ];

        let timelines = assemble_timeline(&results).unwrap();
        assert_eq!(timelines.len(), 1);
        let timeline = &timelines[0];
        assert_eq!(timeline.time_order[0].segment_id, 1);
        assert_eq!(timeline.relevance_order[0].segment_id, 1);
        assert_eq!(timeline.time_order[1].segment_id, 2);
        assert!((timeline.total_relevant_s - 10.0).abs() < 1e-9);

        // No video hits, no timeline.
        assert!(assemble_timeline(&[]).is_none());
    }
}
