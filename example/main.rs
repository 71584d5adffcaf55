use chrono::NaiveDate;
use dagloader::testing::MockWarehouse;
use dagloader::*;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const SONGPLAY_INSERT: &str = "
    SELECT md5(events.sessionid || events.start_time) songplay_id,
           events.start_time, events.userid, events.level, songs.song_id,
           songs.artist_id, events.sessionid, events.location, events.useragent
    FROM (SELECT TIMESTAMP 'epoch' + ts/1000 * interval '1 second' AS start_time, *
          FROM staging_events WHERE page='NextSong') events
    LEFT JOIN staging_songs songs
      ON events.song = songs.title
     AND events.artist = songs.artist_name
     AND events.length = songs.duration";

const USER_INSERT: &str = "
    SELECT distinct userid, firstname, lastname, gender, level
    FROM staging_events WHERE page='NextSong'";

const SONG_INSERT: &str = "
    SELECT distinct song_id, title, artist_id, year, duration FROM staging_songs";

const ARTIST_INSERT: &str = "
    SELECT distinct artist_id, artist_name, artist_location, artist_latitude, artist_longitude
    FROM staging_songs";

const TIME_INSERT: &str = "
    SELECT start_time, extract(hour from start_time), extract(day from start_time),
           extract(week from start_time), extract(month from start_time),
           extract(year from start_time), extract(dayofweek from start_time)
    FROM songplays";

fn sparkify() -> Result<DependencyGraph, Box<dyn std::error::Error>> {
    let stage = |table: &str, key: &str| StageLoad {
        iam_role: Some("arn:aws:iam::000000000000:role/sparkify-redshift".to_string()),
        ..StageLoad::new(table, "akwayaga", key, "us-west-2")
    };

    let mut b = GraphBuilder::new();
    b.add_task(Task::no_op("Begin_execution"))
        .add_task(Task::sql(
            "create_tables",
            [
                "CREATE TABLE IF NOT EXISTS staging_events (artist varchar, ts bigint, userid int)",
                "CREATE TABLE IF NOT EXISTS staging_songs (song_id varchar, title varchar)",
                "TRUNCATE staging_events",
                "TRUNCATE staging_songs",
            ],
        ))
        .add_task(Task::stage("Stage_events", stage("staging_events", "log-data/{year}/{month}")))
        .add_task(Task::stage("Stage_songs", stage("staging_songs", "song-data")))
        .add_task(Task::load_fact("Load_songplays_fact_table", "songplays", SONGPLAY_INSERT))
        .add_task(Task::load_dimension("Load_user_dim_table", "users", USER_INSERT, true))
        .add_task(Task::load_dimension("Load_song_dim_table", "songs", SONG_INSERT, true))
        .add_task(Task::load_dimension("Load_artist_dim_table", "artists", ARTIST_INSERT, true))
        .add_task(Task::load_dimension("Load_time_dim_table", "time", TIME_INSERT, true))
        .add_task(Task::quality_check(
            "Run_data_quality_checks",
            "songplays",
            vec![
                QualityCheck::row_count_positive("songplays")?,
                QualityCheck::no_nulls("users", "userid")?,
            ],
        ))
        .add_task(Task::no_op("End_execution"));

    // Staging truncation must finish before either COPY starts.
    b.add_edge("Begin_execution", "create_tables")
        .add_edge("create_tables", "Stage_events")
        .add_edge("create_tables", "Stage_songs")
        .add_edge("Stage_events", "Load_songplays_fact_table")
        .add_edge("Stage_songs", "Load_songplays_fact_table");
    for dim in [
        "Load_user_dim_table",
        "Load_song_dim_table",
        "Load_artist_dim_table",
        "Load_time_dim_table",
    ] {
        b.add_edge("Load_songplays_fact_table", dim)
            .add_edge(dim, "Run_data_quality_checks");
    }
    b.add_edge("Run_data_quality_checks", "End_execution");

    Ok(b.build()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RunConfig::load(None)?;
    let graph = sparkify()?;

    println!("=== task graph ===");
    print!("{}", graph.render());

    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.set_source_rows(
        "s3://akwayaga/log-data/2018/11",
        vec![vec![json!({"userid": 15, "page": "NextSong"})]],
    );
    warehouse.set_select_rows(SONGPLAY_INSERT, vec![vec![json!("9c0f4cb2"), json!(15)]]);
    warehouse.set_query_result("IS NULL", RowSet::scalar("count", 0));

    let ctx = RunContext::new(
        NaiveDate::from_ymd_opt(2018, 11, 1).ok_or("invalid run date")?,
        Arc::new(ConcurrencyLimited::new(
            Arc::clone(&warehouse),
            config.max_concurrent_tasks,
        )),
        Arc::new(S3Locators),
    );

    let engine = Engine::new(config)?;
    let report = engine.run(&graph, ctx, CancellationToken::new()).await;

    println!("=== run report ===");
    print!("{}", report.summary());
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
