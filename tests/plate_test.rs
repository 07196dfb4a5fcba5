//! Plate template lifecycle tests against a live Postgres.
//!
//! Set DATABASE_URL to run; each test is skipped otherwise.

use labplate::plate::{
    DefaultLayoutHandler, PlateLayoutHandlerRegistry, PlateManager, Position, WellGroup,
    WellGroupType,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

async fn manager() -> Option<(PgPool, PlateManager)> {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .ok()?;
    sqlx::migrate!("./migrations").run(&pool).await.ok()?;

    let mut registry = PlateLayoutHandlerRegistry::new();
    registry.register(Arc::new(DefaultLayoutHandler));
    Some((pool.clone(), PlateManager::new(pool, Arc::new(registry))))
}

async fn plate_type_96(manager: &PlateManager) -> i32 {
    manager
        .plate_types()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.rows == 8 && t.cols == 12)
        .unwrap()
        .plate_type_id
}

#[tokio::test]
async fn template_is_created_with_seeded_control_groups() {
    let Some((_, manager)) = manager().await else { return };
    let container = Uuid::new_v4();
    let plate_type_id = plate_type_96(&manager).await;

    let template = manager
        .create_plate_template(container, "blank", "neutralization template", plate_type_id)
        .await
        .unwrap();

    assert!(template.plate_id.is_some());
    assert!(template.template);
    assert_eq!(template.wells.len(), 96);
    assert!(template
        .group_by_name(WellGroupType::Control, "Positive")
        .is_some());
    assert!(template
        .group_by_name(WellGroupType::Control, "Negative")
        .is_some());

    // a second template with the same name is rejected
    let err = manager
        .create_plate_template(container, "blank", "neutralization template", plate_type_id)
        .await;
    assert!(err.is_err());

    // an unknown assay type is rejected
    let err = manager
        .create_plate_template(container, "elisa", "other", plate_type_id)
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn painting_groups_and_values_round_trips_through_the_diff_save() {
    let Some((_, manager)) = manager().await else { return };
    let container = Uuid::new_v4();
    let plate_type_id = plate_type_96(&manager).await;

    let mut plate = manager
        .create_plate_template(container, "blank", "painted", plate_type_id)
        .await
        .unwrap();

    let a1 = Position::new(0, 0);
    let b1 = Position::new(1, 0);
    let c1 = Position::new(2, 0);
    for (position, value) in [(a1, 95.0), (b1, 97.0), (c1, 40.0)] {
        plate.well_mut(position).unwrap().value = Some(value);
    }
    {
        let positive = plate
            .well_groups
            .iter_mut()
            .find(|g| g.name == "Positive")
            .unwrap();
        positive.add_position(a1);
        positive.add_position(b1);
        // re-adding an existing position is a no-op
        positive.add_position(a1);
    }

    let saved = manager.save(plate).await.unwrap();
    let reloaded = manager
        .plate(container, saved.plate_id.unwrap())
        .await
        .unwrap();

    assert_eq!(reloaded.well(a1).unwrap().value, Some(95.0));
    assert_eq!(reloaded.well(c1).unwrap().value, Some(40.0));
    let positive = reloaded
        .group_by_name(WellGroupType::Control, "Positive")
        .unwrap();
    assert_eq!(positive.positions(), &[a1, b1]);

    let stats = positive.stats(&reloaded);
    assert_eq!(stats.n, 2);
    assert!((stats.mean - 96.0).abs() < 1e-12);
    assert!((stats.stddev - std::f64::consts::SQRT_2).abs() < 1e-9);
}

#[tokio::test]
async fn excluded_wells_are_dropped_from_group_stats() {
    let Some((_, manager)) = manager().await else { return };
    let container = Uuid::new_v4();
    let plate_type_id = plate_type_96(&manager).await;

    let mut plate = manager
        .create_plate_template(container, "blank", "excluded", plate_type_id)
        .await
        .unwrap();
    let a1 = Position::new(0, 0);
    let b1 = Position::new(1, 0);
    plate.well_mut(a1).unwrap().value = Some(10.0);
    plate.well_mut(b1).unwrap().value = Some(90.0);
    plate.well_mut(b1).unwrap().excluded = true;
    {
        let negative = plate
            .well_groups
            .iter_mut()
            .find(|g| g.name == "Negative")
            .unwrap();
        negative.set_positions(vec![a1, b1]);
    }

    let saved = manager.save(plate).await.unwrap();
    let reloaded = manager
        .plate(container, saved.plate_id.unwrap())
        .await
        .unwrap();
    let negative = reloaded
        .group_by_name(WellGroupType::Control, "Negative")
        .unwrap();
    let stats = negative.stats(&reloaded);
    assert_eq!(stats.n, 1);
    assert_eq!(stats.mean, 10.0);
    assert!(stats.stddev.is_nan());
}

#[tokio::test]
async fn removing_a_group_deletes_its_row() {
    let Some((_, manager)) = manager().await else { return };
    let container = Uuid::new_v4();
    let plate_type_id = plate_type_96(&manager).await;

    let mut plate = manager
        .create_plate_template(container, "blank", "pruned", plate_type_id)
        .await
        .unwrap();
    plate.well_groups.retain(|g| g.name != "Negative");

    let saved = manager.save(plate).await.unwrap();
    let reloaded = manager
        .plate(container, saved.plate_id.unwrap())
        .await
        .unwrap();
    assert_eq!(reloaded.well_groups.len(), 1);
    assert!(reloaded
        .group_by_name(WellGroupType::Control, "Negative")
        .is_none());
}

#[tokio::test]
async fn renamed_group_keeps_its_lsid_and_samples_order_by_top_left() {
    let Some((_, manager)) = manager().await else { return };
    let container = Uuid::new_v4();
    let plate_type_id = plate_type_96(&manager).await;

    let mut plate = manager
        .create_plate_template(container, "blank", "renamed groups", plate_type_id)
        .await
        .unwrap();
    let original_lsid = plate
        .group_by_name(WellGroupType::Control, "Positive")
        .unwrap()
        .lsid
        .clone();

    {
        let positive = plate
            .well_groups
            .iter_mut()
            .find(|g| g.name == "Positive")
            .unwrap();
        positive.name = "High Control".to_string();
        positive.add_position(Position::new(0, 0));
    }
    let saved = manager.save(plate).await.unwrap();

    let renamed = saved
        .group_by_name(WellGroupType::Control, "High Control")
        .unwrap();
    assert_eq!(renamed.lsid, original_lsid);
    assert!(saved
        .group_by_name(WellGroupType::Control, "Positive")
        .is_none());

    // sample groups come back ordered by their top-left well, not insertion
    let mut plate = saved;
    let mut late = WellGroup::new("Specimen 2", WellGroupType::Sample);
    late.add_position(Position::new(0, 6));
    let mut early = WellGroup::new("Specimen 1", WellGroupType::Sample);
    early.add_position(Position::new(0, 3));
    plate.well_groups.push(late);
    plate.well_groups.push(early);

    let reloaded = manager.save(plate).await.unwrap();
    let samples: Vec<&str> = reloaded
        .groups_of_type(WellGroupType::Sample)
        .map(|g| g.name.as_str())
        .collect();
    assert_eq!(samples, vec!["Specimen 1", "Specimen 2"]);
}

#[tokio::test]
async fn delete_removes_plate_groups_and_wells() {
    let Some((pool, manager)) = manager().await else { return };
    let container = Uuid::new_v4();
    let plate_type_id = plate_type_96(&manager).await;

    let plate = manager
        .create_plate_template(container, "blank", "doomed", plate_type_id)
        .await
        .unwrap();
    let plate_id = plate.plate_id.unwrap();

    manager.delete_plate(container, plate_id).await.unwrap();
    assert!(manager.plate(container, plate_id).await.is_err());

    let wells: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM labplate.well WHERE plate_id = $1")
        .bind(plate_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(wells, 0);
}
