//! Parameter sync and single-range edits against the in-memory repository.

use serde_json::{json, Value};

use lab_ranges::db::repositories::LocalRepository;
use lab_ranges::db::repository::ReferenceRangeRepository;
use lab_ranges::db::schema_cache::{SchemaInfo, TenantKey};
use lab_ranges::models::{
    AnalysisId, ParameterInput, ParameterSpec, RangeId, RawRange, AUTO_FILL_NOTE,
    NO_REFERENCE_NOTE,
};
use lab_ranges::services::{SyncError, SyncOutcome};

const ANALYSIS: i64 = 7;

fn specs(body: Value) -> Vec<ParameterSpec> {
    serde_json::from_value::<Vec<ParameterInput>>(body)
        .unwrap()
        .into_iter()
        .enumerate()
        .map(|(index, input)| input.into_spec(index))
        .collect()
}

fn tenant() -> TenantKey {
    TenantKey::default()
}

async fn sync(repo: &LocalRepository, body: Value) -> Result<SyncOutcome, SyncError> {
    repo.sync_parameters(&tenant(), AnalysisId::new(ANALYSIS), specs(body))
        .await
}

#[tokio::test]
async fn test_sync_inserts_parameters_with_gap_filled_ranges() {
    let repo = LocalRepository::new();
    let outcome = sync(
        &repo,
        json!([
            {
                "name": "Glucosa",
                "unit": "mg/dL",
                "valorReferencia": [
                    {"sexo": "Ambos", "edad_min": 18, "edad_max": 65, "valor_min": 70, "valor_max": 110}
                ]
            },
            { "name": "Colesterol" }
        ]),
    )
    .await
    .unwrap();

    assert_eq!(outcome.inserted_ranges, 3);
    assert_eq!(outcome.parameters.len(), 2);

    let glucose = &outcome.parameters[0];
    assert_eq!(glucose.name, "Glucosa");
    assert_eq!(glucose.position, Some(1));
    let spans: Vec<(Option<i32>, Option<i32>)> = glucose
        .reference_ranges
        .iter()
        .map(|r| (r.age_min, r.age_max))
        .collect();
    assert_eq!(
        spans,
        vec![(Some(0), Some(17)), (Some(18), Some(65)), (Some(66), Some(120))]
    );
    assert_eq!(
        glucose.reference_ranges[0].notes.as_deref(),
        Some(AUTO_FILL_NOTE)
    );

    assert_eq!(outcome.parameters[1].position, Some(2));
    assert!(outcome.parameters[1].reference_ranges.is_empty());
}

#[tokio::test]
async fn test_omitted_ranges_preserve_existing_rows() {
    let repo = LocalRepository::new();
    let first = sync(
        &repo,
        json!([{
            "name": "Hemoglobina",
            "reference_ranges": [{"sex": "M", "lower": 13.5, "upper": 17.5}]
        }]),
    )
    .await
    .unwrap();
    let id = first.parameters[0].id;
    let before = repo.stored_ranges(id);
    assert_eq!(before.len(), 1);

    let second = sync(&repo, json!([{ "id": id.value(), "name": "Hemoglobina total" }]))
        .await
        .unwrap();

    assert_eq!(second.inserted_ranges, 0);
    assert_eq!(second.parameters[0].id, id);
    assert_eq!(second.parameters[0].name, "Hemoglobina total");
    assert_eq!(repo.stored_ranges(id), before);

    // null and [] without the clear flag behave like omission
    sync(&repo, json!([{ "id": id.value(), "name": "Hb", "reference_ranges": null }]))
        .await
        .unwrap();
    sync(&repo, json!([{ "id": id.value(), "name": "Hb", "reference_ranges": [] }]))
        .await
        .unwrap();
    assert_eq!(repo.stored_ranges(id), before);
}

#[tokio::test]
async fn test_clear_ranges_flag_removes_rows() {
    let repo = LocalRepository::new();
    let first = sync(
        &repo,
        json!([{ "name": "TSH", "reference_ranges": [{"lower": 0.4, "upper": 4.0}] }]),
    )
    .await
    .unwrap();
    let id = first.parameters[0].id;

    let cleared = sync(
        &repo,
        json!([{ "id": id.value(), "name": "TSH", "reference_ranges": [], "clearRanges": true }]),
    )
    .await
    .unwrap();

    assert_eq!(cleared.inserted_ranges, 0);
    assert!(repo.stored_ranges(id).is_empty());
}

#[tokio::test]
async fn test_parameters_missing_from_sync_are_deleted() {
    let repo = LocalRepository::new();
    let analysis = AnalysisId::new(ANALYSIS);
    let keep = repo.seed_parameter(analysis, "Sodio");
    repo.seed_parameter(analysis, "Potasio");
    let other = repo.seed_parameter(AnalysisId::new(99), "Cloro");

    let outcome = sync(&repo, json!([{ "id": keep.value(), "name": "Sodio" }]))
        .await
        .unwrap();

    assert_eq!(outcome.parameters.len(), 1);
    assert_eq!(outcome.parameters[0].id, keep);
    assert_eq!(repo.parameter_count(), 2);
    let remaining = repo
        .list_parameters(&tenant(), AnalysisId::new(99))
        .await
        .unwrap();
    assert_eq!(remaining[0].id, other);
}

#[tokio::test]
async fn test_unknown_parameter_id_is_inserted_as_new() {
    let repo = LocalRepository::new();
    let outcome = sync(&repo, json!([{ "id": 4242, "name": "Calcio" }]))
        .await
        .unwrap();
    assert_eq!(outcome.parameters.len(), 1);
    assert_ne!(outcome.parameters[0].id.value(), 4242);
}

#[tokio::test]
async fn test_legacy_schema_stores_letters_and_reads_tokens() {
    let repo = LocalRepository::with_schema(SchemaInfo::legacy());
    let outcome = sync(
        &repo,
        json!([{
            "name": "Ferritina",
            "reference_ranges": [
                {"sexo": "Femenino", "valor_min": 15, "valor_max": 150},
                {"sexo": "masculino", "valor_min": 30, "valor_max": 400}
            ]
        }]),
    )
    .await
    .unwrap();

    let id = outcome.parameters[0].id;
    let mut stored: Vec<String> = repo.stored_ranges(id).into_iter().map(|r| r.sex).collect();
    stored.sort();
    assert_eq!(stored, vec!["F".to_string(), "M".to_string()]);

    let mut read: Vec<String> = outcome.parameters[0]
        .reference_ranges
        .iter()
        .map(|r| r.sex.clone())
        .collect();
    read.sort();
    assert_eq!(read, vec!["Femenino".to_string(), "Masculino".to_string()]);
}

#[tokio::test]
async fn test_stale_vocabulary_fails_with_snapshot_then_recovers() {
    let repo = LocalRepository::new();
    // Prime the cache with the migrated vocabulary, then roll the database back.
    assert!(!repo.schema_info(&tenant()).await.vocabulary.legacy_active);
    repo.set_live_schema(SchemaInfo::legacy());

    let body = json!([{
        "name": "Creatinina",
        "reference_ranges": [{"sex": "Ambos", "lower": 0.6, "upper": 1.2}]
    }]);

    let err = sync(&repo, body.clone()).await.unwrap_err();
    assert_eq!(err.code(), "REFERENCE_RANGE_CONSTRAINT_FAIL");
    assert_eq!(err.status(), 400);
    let details = err.details().unwrap();
    assert_eq!(details["allowedTokens"], json!(["O", "M", "F"]));
    assert!(details["constraints"][0].as_str().unwrap().contains("sexo"));
    assert_eq!(repo.parameter_count(), 0);

    let outcome = sync(&repo, body).await.unwrap();
    let id = outcome.parameters[0].id;
    assert_eq!(repo.stored_ranges(id)[0].sex, "O");
    assert_eq!(outcome.parameters[0].reference_ranges[0].sex, "Ambos");
}

#[tokio::test]
async fn test_failed_sync_rolls_back_everything() {
    let repo = LocalRepository::new();
    let first = sync(
        &repo,
        json!([{ "name": "Urea", "reference_ranges": [{"lower": 10, "upper": 50}] }]),
    )
    .await
    .unwrap();
    let id = first.parameters[0].id;
    let before = repo.stored_ranges(id);

    let err = sync(
        &repo,
        json!([
            { "id": id.value(), "name": "Urea", "reference_ranges": [{"lower": 1, "upper": 2}] },
            {
                "name": "Acido urico",
                "reference_ranges": [
                    {"sex": "F", "age_min": 0, "age_max": 17, "lower": 1, "upper": 2},
                    {"sex": "F", "age_min": 10, "age_max": 30, "lower": 3, "upper": 4}
                ]
            }
        ]),
    )
    .await
    .unwrap_err();

    assert_eq!(err.code(), "REFERENCE_RANGE_OVERLAP");
    assert_eq!(repo.parameter_count(), 1);
    assert_eq!(repo.stored_ranges(id), before);
}

#[tokio::test]
async fn test_inverted_bounds_name_the_parameter() {
    let repo = LocalRepository::new();
    let err = sync(
        &repo,
        json!([{ "name": "Albumina", "reference_ranges": [{"lower": 5.0, "upper": 3.5}] }]),
    )
    .await
    .unwrap_err();

    match err {
        SyncError::InvalidInterval {
            lower,
            upper,
            parameter,
        } => {
            assert_eq!((lower, upper), (5.0, 3.5));
            assert_eq!(parameter.as_deref(), Some("Albumina"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(repo.parameter_count(), 0);
}

#[tokio::test]
async fn test_no_reference_rows_fall_back_to_one_placeholder() {
    let repo = LocalRepository::new();
    let outcome = sync(
        &repo,
        json!([{
            "name": "Vitamina D",
            "reference_ranges": [{"notes": NO_REFERENCE_NOTE}, {}]
        }]),
    )
    .await
    .unwrap();

    assert_eq!(outcome.inserted_ranges, 1);
    let ranges = &outcome.parameters[0].reference_ranges;
    assert_eq!(ranges.len(), 1);
    assert_eq!(ranges[0].sex, "Ambos");
    assert_eq!((ranges[0].age_min, ranges[0].age_max), (None, None));
    assert_eq!(ranges[0].notes.as_deref(), Some(NO_REFERENCE_NOTE));
}

#[tokio::test]
async fn test_single_range_lifecycle() {
    let repo = LocalRepository::new();
    let parameter = repo.seed_parameter(AnalysisId::new(ANALYSIS), "Plaquetas");

    let created = repo
        .insert_reference_range(
            &tenant(),
            parameter,
            RawRange(json!({"sex": "f", "age_min": 0, "age_max": 40, "lower": 150, "upper": 400})),
        )
        .await
        .unwrap();
    assert_eq!(created.sex, "Femenino");

    // Same sex, overlapping span
    let err = repo
        .insert_reference_range(
            &tenant(),
            parameter,
            RawRange(json!({"sex": "Femenino", "age_min": 30, "age_max": 60, "lower": 140})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "REFERENCE_RANGE_OVERLAP");

    // Adjacent span and a different sex are both fine
    repo.insert_reference_range(
        &tenant(),
        parameter,
        RawRange(json!({"sex": "F", "age_min": 40, "age_max": 120, "lower": 140})),
    )
    .await
    .unwrap();
    repo.insert_reference_range(
        &tenant(),
        parameter,
        RawRange(json!({"sex": "M", "age_min": 0, "age_max": 60, "lower": 150})),
    )
    .await
    .unwrap();

    let updated = repo
        .update_reference_range(
            &tenant(),
            created.id,
            RawRange(json!({"sex": "F", "age_min": 0, "age_max": 40, "lower": 160, "upper": 410})),
        )
        .await
        .unwrap();
    assert_eq!(updated.lower, Some(160.0));

    let listed = repo.list_reference_ranges(&tenant(), parameter).await.unwrap();
    assert_eq!(listed.len(), 3);

    repo.delete_reference_range(&tenant(), created.id)
        .await
        .unwrap();
    let err = repo
        .delete_reference_range(&tenant(), created.id)
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn test_single_range_validation_errors() {
    let repo = LocalRepository::new();
    let parameter = repo.seed_parameter(AnalysisId::new(ANALYSIS), "Leucocitos");

    let err = repo
        .insert_reference_range(&tenant(), parameter, RawRange(json!({"lower": 9, "upper": 4})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_RANGE_INTERVAL");

    let err = repo
        .insert_reference_range(
            &tenant(),
            parameter,
            RawRange(json!({"age_min": 30, "age_max": 10, "lower": 1})),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "REFERENCE_RANGE_NORMALIZATION_FAIL");

    let err = repo
        .insert_reference_range(&tenant(), parameter, RawRange(json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "REFERENCE_RANGE_NORMALIZATION_FAIL");

    let err = repo
        .update_reference_range(&tenant(), RangeId::new(555), RawRange(json!({"lower": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");

    let err = repo
        .list_reference_ranges(&tenant(), lab_ranges::models::ParameterId::new(404))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 404);
}

#[tokio::test]
async fn test_tenants_keep_separate_schema_snapshots() {
    let repo = LocalRepository::new();
    let a = TenantKey::new("lab-a");
    let b = TenantKey::new("lab-b");

    assert!(!repo.schema_info(&a).await.vocabulary.legacy_active);
    repo.set_live_schema(SchemaInfo::legacy());

    // lab-b introspects for the first time and sees the legacy constraint,
    // lab-a keeps its cached snapshot until invalidated.
    assert!(repo.schema_info(&b).await.vocabulary.legacy_active);
    assert!(!repo.schema_info(&a).await.vocabulary.legacy_active);

    repo.invalidate_schema(&a);
    assert!(repo.schema_info(&a).await.vocabulary.legacy_active);
}
