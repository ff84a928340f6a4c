use crate::scripted::{Behaviour, ScriptedProvider};

use contest_cluster::{contest::PlanParameters, prelude::*};
use std::{collections::HashMap, fs, path::Path, sync::Arc, thread, time::Duration};
use time::macros::format_description;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod scripted;

fn init_logger() {
    let local_offset =
        time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_ansi(false)
        .with_thread_names(true)
        .with_timer(timer)
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn teams(ids: &[&str]) -> Vec<Team> {
    ids.iter()
        .map(|id| Team::new(*id, format!("/submissions/{id}.zip")))
        .collect()
}

fn league(teams: &[Team]) -> League {
    MatchPlanner::new(100)
        .plan(teams, &[Layout::random(1)], 1, &[], false)
        .unwrap()
        .remove(0)
}

fn planned_run(teams: &[Team], league: &League) -> ContestRun {
    ContestRun::new(
        "test",
        league.index,
        PlanParameters {
            teams: teams.iter().map(|t| t.id.clone()).collect(),
            split_count: 1,
            layouts: vec![Layout::random(1).key()],
        },
        league.matches.clone(),
    )
}

fn stem(red: &str, blue: &str) -> String {
    MatchId::new(0, red, blue, &Layout::random(1)).file_stem()
}

fn pool(capacities: &[usize]) -> WorkerPool {
    WorkerPool::new(
        capacities
            .iter()
            .enumerate()
            .map(|(i, capacity)| {
                Worker::new(
                    format!("node{}", i + 1),
                    "contest",
                    Credentials::Password("secret".into()),
                    *capacity,
                )
            })
            .collect(),
    )
    .unwrap()
}

fn config() -> ContestConfig {
    let mut config = ContestConfig::new()
        .with_verbose(false)
        .with_max_attempts(3);
    config.base_timeout_secs = 10;
    config.step_timeout_ms = 0;
    config
}

fn scheduler(dir: &Path, teams: &[Team], config: &ContestConfig) -> Scheduler {
    let logs = dir.join("logs");
    let replays = dir.join("replays");
    fs::create_dir_all(&logs).unwrap();
    fs::create_dir_all(&replays).unwrap();
    let runner = MatchRunner::new(
        EngineConfig::new("play {red} {blue} {layout}", "game.replay"),
        LayoutBundle::default(),
        logs,
        replays,
        "t",
    );
    Scheduler::new(runner, teams, config)
}

fn by_stem(run: &ContestRun, stem: &str) -> Match {
    run.matches
        .iter()
        .find(|m| m.id.file_stem() == stem)
        .cloned()
        .unwrap()
}

#[test]
fn round_robin_runs_every_match_within_capacity() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b", "c", "d", "e"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let provider = ScriptedProvider::new(HashMap::new());
    let pool = pool(&[1, 2]);
    let summary = scheduler(dir.path(), &teams, &config())
        .run(&pool, Arc::new(provider.clone()), &mut collector)
        .unwrap();

    assert_eq!(summary.dispatched, 10);
    assert_eq!(summary.completed, 10);
    assert_eq!(summary.unfinished, 0);
    assert!(!summary.cancelled);
    assert!(provider.peak_load("node1") <= 1);
    assert!(provider.peak_load("node2") <= 2);
    assert_eq!(pool.available(), 3);

    // the manifest on disk is the final state
    let on_disk = contest_cluster::collector::load_manifest(&collector.manifest_path()).unwrap();
    assert!(on_disk.is_finished());
    assert_eq!(on_disk.completed, 10);
    for game in &on_disk.matches {
        assert_eq!(game.status, MatchStatus::Completed);
        assert!(game.log.as_ref().unwrap().is_file());
        assert!(game.replay.as_ref().unwrap().is_file());
    }

    // red always wins by one: a beats everyone
    let standings = RankingAggregator::default().aggregate(&on_disk.matches);
    let order = standings.iter().map(|s| s.team.as_str()).collect::<Vec<_>>();
    assert_eq!(order, ["a", "b", "c", "d", "e"]);
    assert_eq!(standings[0].points, 12);
    assert_eq!(standings[4].points, 0);
}

#[test]
fn resume_only_runs_unfinished_matches() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b", "c", "d"]);
    let league = league(&teams);

    let done = {
        let mut collector =
            ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();
        let mut done = vec![];
        for (i, game) in league.matches.iter().enumerate() {
            let mut game = game.clone();
            match i {
                0..=2 => {
                    game.mark_dispatched("node1").unwrap();
                    game.mark_running().unwrap();
                    game.complete(MatchOutcome::played(-2)).unwrap();
                    done.push(game.id.file_stem());
                }
                // interrupted while running
                3 => {
                    game.mark_dispatched("node1").unwrap();
                    game.mark_running().unwrap();
                }
                _ => continue,
            }
            collector.record(game).unwrap();
        }
        done
    };

    let mut collector = ResultCollector::resume(dir.path(), planned_run(&teams, &league)).unwrap();
    let provider = ScriptedProvider::new(HashMap::new());
    let summary = scheduler(dir.path(), &teams, &config())
        .run(&pool(&[2]), Arc::new(provider.clone()), &mut collector)
        .unwrap();

    assert_eq!(summary.carried_over, 3);
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.completed, 3);
    let executed = provider.executions();
    assert_eq!(executed.len(), 3);
    assert!(executed.iter().all(|stem| !done.contains(stem)));

    let run = collector.into_run();
    assert!(run.is_finished());
    // carried over results are kept as they were
    for stem in &done {
        assert_eq!(by_stem(&run, stem).outcome.unwrap().score, -2);
    }
    let standings = RankingAggregator::default().aggregate(&run.matches);
    assert_eq!(standings.iter().map(|s| s.played).sum::<u32>(), 12);
}

#[test]
fn resume_rejects_another_roster() {
    let dir = tempfile::tempdir().unwrap();
    let teams_before = teams(&["a", "b", "c"]);
    let league_before = league(&teams_before);
    ResultCollector::create(dir.path(), planned_run(&teams_before, &league_before)).unwrap();

    let teams_after = teams(&["a", "b", "c", "d"]);
    let league_after = league(&teams_after);
    let err = ResultCollector::resume(dir.path(), planned_run(&teams_after, &league_after))
        .unwrap_err();
    assert!(matches!(err, ContestError::ResumeMismatch(_)));
}

#[test]
fn connectivity_faults_are_retried_elsewhere_then_exhausted() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let script = HashMap::from([(stem("a", "b"), Behaviour::Unreachable)]);
    let provider = ScriptedProvider::new(script);
    let summary = scheduler(dir.path(), &teams, &config())
        .run(&pool(&[1, 1]), Arc::new(provider.clone()), &mut collector)
        .unwrap();

    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.retried, 2);
    assert_eq!(summary.failed, 1);

    let hosts = provider
        .connections()
        .into_iter()
        .map(|(_, host)| host)
        .collect::<Vec<_>>();
    assert_eq!(hosts.len(), 3);
    assert!(hosts.windows(2).all(|w| w[0] != w[1]));

    let game = by_stem(collector.run(), &stem("a", "b"));
    assert_eq!(game.status, MatchStatus::Failed);
    assert_eq!(game.attempts, 3);
    let outcome = game.outcome.unwrap();
    assert_eq!(outcome.winner, Winner::Nobody);
    assert!(outcome.red_forfeit && outcome.blue_forfeit);

    let standings = RankingAggregator::default().aggregate(&collector.run().matches);
    assert!(standings.iter().all(|s| s.losses == 1 && s.points == 0));
}

#[test]
fn exhausted_match_can_be_scored_as_a_tie() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let config = config()
        .with_max_attempts(2)
        .with_exhausted_retry_policy(ExhaustedRetryPolicy::Tie);
    let script = HashMap::from([(stem("a", "b"), Behaviour::Unreachable)]);
    scheduler(dir.path(), &teams, &config)
        .run(&pool(&[1]), Arc::new(ScriptedProvider::new(script)), &mut collector)
        .unwrap();

    let game = by_stem(collector.run(), &stem("a", "b"));
    assert_eq!(game.status, MatchStatus::Failed);
    assert_eq!(game.attempts, 2);
    assert_eq!(game.outcome.unwrap().winner, Winner::Tie);
}

#[test]
fn transient_fault_recovers_on_retry() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b", "c"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let script = HashMap::from([(stem("a", "c"), Behaviour::FlakyThenRedWin(1))]);
    let summary = scheduler(dir.path(), &teams, &config())
        .run(&pool(&[1, 1]), Arc::new(ScriptedProvider::new(script)), &mut collector)
        .unwrap();

    assert_eq!(summary.retried, 1);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    let game = by_stem(collector.run(), &stem("a", "c"));
    assert_eq!(game.status, MatchStatus::Completed);
    assert_eq!(game.attempts, 2);
    assert_eq!(game.outcome.unwrap().score, 2);
}

#[test]
fn game_fault_is_a_forfeit_without_retry() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let script = HashMap::from([(stem("a", "b"), Behaviour::RedCrash)]);
    let provider = ScriptedProvider::new(script);
    let summary = scheduler(dir.path(), &teams, &config())
        .run(&pool(&[1, 1]), Arc::new(provider.clone()), &mut collector)
        .unwrap();

    assert_eq!(summary.dispatched, 1);
    assert_eq!(summary.retried, 0);
    assert_eq!(provider.executions().len(), 1);

    let game = by_stem(collector.run(), &stem("a", "b"));
    assert_eq!(game.status, MatchStatus::Completed);
    assert_eq!(game.attempts, 1);
    let outcome = game.outcome.unwrap();
    assert_eq!(outcome.winner, Winner::Blue);
    assert!(outcome.red_forfeit && !outcome.blue_forfeit);
    assert!(game.replay.is_none());

    let standings = RankingAggregator::default().aggregate(&collector.run().matches);
    assert_eq!(standings[0].team, "b");
}

#[test]
fn panicking_session_is_retried_then_exhausted() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let script = HashMap::from([(stem("a", "b"), Behaviour::Panic)]);
    let pool = pool(&[1]);
    let summary = scheduler(dir.path(), &teams, &config().with_max_attempts(2))
        .run(&pool, Arc::new(ScriptedProvider::new(script)), &mut collector)
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(pool.available(), 1);
    assert_eq!(
        by_stem(collector.run(), &stem("a", "b")).status,
        MatchStatus::Failed
    );
}

#[test]
fn cancelled_before_start_dispatches_nothing() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b", "c"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let provider = ScriptedProvider::new(HashMap::new());
    let idle = scheduler(dir.path(), &teams, &config());
    idle.cancel_token().cancel();
    let summary = idle
        .run(&pool(&[2]), Arc::new(provider.clone()), &mut collector)
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.unfinished, 3);
    assert!(provider.connections().is_empty());
}

#[test]
fn forced_cancel_leaves_match_resumable() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let teams = teams(&["a", "b"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();

    let script = HashMap::from([(stem("a", "b"), Behaviour::Hang)]);
    let first = scheduler(dir.path(), &teams, &config());
    let cancel = first.cancel_token();
    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        cancel.force_cancel();
    });
    let summary = first
        .run(&pool(&[1]), Arc::new(ScriptedProvider::new(script)), &mut collector)
        .unwrap();
    killer.join().unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.unfinished, 1);
    assert_eq!(summary.retried, 0);
    let game = by_stem(collector.run(), &stem("a", "b"));
    assert!(!game.status.is_terminal());
    drop(collector);

    // the next invocation picks the match up again
    let mut collector = ResultCollector::resume(dir.path(), planned_run(&teams, &league)).unwrap();
    let summary = scheduler(dir.path(), &teams, &config())
        .run(&pool(&[1]), Arc::new(ScriptedProvider::new(HashMap::new())), &mut collector)
        .unwrap();
    assert_eq!(summary.carried_over, 0);
    assert_eq!(summary.completed, 1);
    let game = by_stem(collector.run(), &stem("a", "b"));
    assert_eq!(game.status, MatchStatus::Completed);
    assert_eq!(game.attempts, 1);
}

#[test]
fn failed_bookkeeping_stops_in_flight_matches() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let manifest_dir = dir.path().join("league");
    let teams = teams(&["a", "b", "c"]);
    let league = league(&teams);
    let mut collector = ResultCollector::create(&manifest_dir, planned_run(&teams, &league)).unwrap();

    let script = HashMap::from([
        (stem("a", "b"), Behaviour::Slow(300)),
        (stem("a", "c"), Behaviour::Hang),
        (stem("b", "c"), Behaviour::Hang),
    ]);
    let provider = ScriptedProvider::new(script);
    let scheduler = scheduler(dir.path(), &teams, &config());
    let cancel = scheduler.cancel_token();
    let remover = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        fs::remove_dir_all(&manifest_dir).unwrap();
    });

    let started = std::time::Instant::now();
    let res = scheduler.run(&pool(&[2]), Arc::new(provider.clone()), &mut collector);
    remover.join().unwrap();

    assert!(res.is_err());
    assert!(cancel.is_forced());
    assert_eq!(provider.current_load("node1"), 0);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn standings_do_not_depend_on_completion_order() {
    init_logger();
    let teams = teams(&["a", "b", "c", "d"]);
    let league = league(&teams);
    let script = HashMap::from([
        (stem("a", "b"), Behaviour::Score(0)),
        (stem("a", "c"), Behaviour::Score(-4)),
        (stem("b", "d"), Behaviour::Score(-1)),
        (stem("c", "d"), Behaviour::Score(0)),
    ]);

    let mut results = vec![];
    for capacity in [1, 4] {
        let dir = tempfile::tempdir().unwrap();
        let mut collector =
            ResultCollector::create(dir.path(), planned_run(&teams, &league)).unwrap();
        scheduler(dir.path(), &teams, &config())
            .run(
                &pool(&[capacity]),
                Arc::new(ScriptedProvider::new(script.clone())),
                &mut collector,
            )
            .unwrap();
        results.push(RankingAggregator::default().aggregate(&collector.run().matches));
    }
    assert_eq!(results[0], results[1]);
}

#[cfg(unix)]
#[test]
fn local_contest_end_to_end() {
    init_logger();
    let work = tempfile::tempdir().unwrap();
    let teams_root = work.path().join("submissions");
    for id in ["alpha", "beta", "gamma"] {
        fs::create_dir_all(teams_root.join(id)).unwrap();
        fs::write(teams_root.join(id).join("agent.py"), "pass").unwrap();
    }

    let mut config = ContestConfig::new()
        .with_verbose(false)
        .with_work_dir(work.path().join("run"))
        .with_engine(EngineConfig::new(
            "echo 'The Red team wins by 3 points.'; echo replay > game.replay",
            "game.replay",
        ));
    config.teams_root = Some(teams_root);
    config.fixed_layouts_dir = work.path().join("no-layouts");
    config.no_fixed_layouts = 0;
    config.no_random_layouts = 1;
    config.base_timeout_secs = 30;

    let pool = WorkerPool::new(vec![Worker::new(
        "localhost",
        "contest",
        Credentials::Password(String::new()),
        2,
    )])
    .unwrap();
    let provider = LocalProvider::new(work.path().join("sandbox"));
    let runner = ContestRunner::new(config, pool, Arc::new(provider));
    let reports = runner.run(None).unwrap();

    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.summary.completed, 3);
    assert_eq!(report.standings[0].team, "alpha");
    assert_eq!(report.standings[0].points, 6);

    let archive = report.archive.as_ref().unwrap();
    for location in [&archive.stats, &archive.logs, &archive.replays] {
        let Some(Location::Local(path)) = location else {
            panic!("missing local archive: {location:?}");
        };
        assert!(path.is_file());
    }
}
