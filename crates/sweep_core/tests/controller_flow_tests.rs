mod support;

use serde_json::json;
use sweep_core::contract::CombinationMode;
use sweep_core::controller::{FailurePolicy, SweepController, SweepPlan};
use sweep_core::error::{ConfigurationError, PollError, SweepError};
use sweep_core::flavors::Flavor;
use sweep_core::inputs::JobInputs;
use sweep_core::state::{Phase, TerminalStatus};
use support::{
    base_inputs, handle_for, meshcutoff_plan, request, Collaborators, RecordingAnalyzer,
    ScriptedLauncher, ScriptedPoller,
};

#[test]
fn three_combinations_in_batches_of_two_dispatch_two_then_one() {
    let collaborators = Collaborators::default();
    let mut controller =
        SweepController::start(meshcutoff_plan("batches", 2), collaborators.capabilities());

    let summary = controller.run_to_completion().expect("sweep should finish");

    assert_eq!(summary.phase, Phase::Done);
    assert_eq!(summary.batches, 2);
    assert_eq!(collaborators.launcher.batch_sizes(), vec![2, 1]);
    assert_eq!(
        collaborators.poller.polls(),
        vec![
            vec![handle_for("batches", 0), handle_for("batches", 1)],
            vec![handle_for("batches", 2)],
        ]
    );
    assert_eq!(collaborators.analyzer.analyzed_indices(), vec![0, 1, 2]);
    assert_eq!(controller.realized_history().len(), 3);
    assert!(controller.state().in_flight.is_empty());
}

#[test]
fn job_inputs_merge_swept_flag_into_base_parameters() {
    let collaborators = Collaborators::default();
    let mut controller =
        SweepController::start(meshcutoff_plan("inputs", 3), collaborators.capabilities());
    controller.run_to_completion().expect("sweep should finish");

    let launched = collaborators.launcher.launched();
    assert_eq!(launched.len(), 3);
    assert_eq!(
        launched[1].inputs.get("parameters"),
        Some(&json!({"xc-functional": "GGA", "meshcutoff": "200 Ry"}))
    );
    assert_eq!(launched[1].inputs.get("code"), Some(&json!("siesta@localhost")));
}

#[test]
fn product_mode_varies_first_axis_slowest() {
    let payload = request(
        "product",
        &[
            ("a", vec![json!(1), json!(2)]),
            ("b", vec![json!(10), json!(20)]),
        ],
        CombinationMode::Product,
        4,
    );
    let router = Flavor::Plain.router(["a", "b"]).expect("router should build");
    let plan = SweepPlan::new(payload, &router, JobInputs::new()).expect("plan should build");
    let collaborators = Collaborators::default();
    let mut controller = SweepController::start(plan, collaborators.capabilities());
    controller.run_to_completion().expect("sweep should finish");

    let pairs: Vec<_> = collaborators
        .launcher
        .launched()
        .into_iter()
        .map(|job| (job.inputs.get("a").cloned(), job.inputs.get("b").cloned()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            (Some(json!(1)), Some(json!(10))),
            (Some(json!(1)), Some(json!(20))),
            (Some(json!(2)), Some(json!(10))),
            (Some(json!(2)), Some(json!(20))),
        ]
    );
}

#[test]
fn configuration_errors_surface_before_any_dispatch() {
    let mismatched = request(
        "mismatch",
        &[
            ("a", vec![json!(1), json!(2)]),
            ("b", vec![json!(10), json!(20), json!(30)]),
        ],
        CombinationMode::Zip,
        1,
    );
    let router = Flavor::Plain.router(["a", "b"]).expect("router should build");
    let error = SweepPlan::new(mismatched, &router, JobInputs::new()).expect_err("lengths differ");
    assert!(matches!(
        error,
        ConfigurationError::MismatchedAxisLength { .. }
    ));

    let unroutable = request("unroutable", &[("meshcutoff", vec![json!(1)])], CombinationMode::Zip, 1);
    let router = Flavor::Bdg.router(std::iter::empty()).expect("router should build");
    let error = SweepPlan::new(unroutable, &router, JobInputs::new()).expect_err("no rule");
    assert_eq!(
        error,
        ConfigurationError::UnroutableKey {
            key: "meshcutoff".to_string()
        }
    );

    let zero_batch = request("zero", &[("a", vec![json!(1)])], CombinationMode::Zip, 0);
    let router = Flavor::Plain.router(["a"]).expect("router should build");
    let error = SweepPlan::new(zero_batch, &router, JobInputs::new()).expect_err("batch size");
    assert_eq!(error, ConfigurationError::InvalidBatchSize);
}

#[test]
fn rejected_launch_is_recorded_and_batch_continues() {
    let collaborators = Collaborators {
        launcher: ScriptedLauncher::rejecting([1]),
        ..Collaborators::default()
    };
    let mut controller =
        SweepController::start(meshcutoff_plan("rejects", 3), collaborators.capabilities());

    controller.begin().expect("begin");
    let launched = controller.dispatch_batch().expect("dispatch");

    assert_eq!(launched, 2);
    assert_eq!(controller.phase(), Phase::AwaitingBatch);
    assert_eq!(controller.state().rejections.len(), 1);
    assert_eq!(controller.state().rejections[0].combination.index, 1);
    assert!(controller.state().rejections[0].reason.contains("malformed"));
    assert_eq!(controller.realized_history().len(), 3);

    let summary = controller.run_to_completion().expect("sweep should finish");
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.rejected, 1);
    assert_eq!(collaborators.analyzer.analyzed_indices(), vec![0, 2]);
}

#[test]
fn batch_with_every_launch_rejected_moves_on() {
    let collaborators = Collaborators {
        launcher: ScriptedLauncher::rejecting([0]),
        ..Collaborators::default()
    };
    let mut controller =
        SweepController::start(meshcutoff_plan("all-rejected", 1), collaborators.capabilities());

    controller.begin().expect("begin");
    assert_eq!(controller.dispatch_batch().expect("dispatch"), 0);
    assert_eq!(controller.phase(), Phase::Dispatching);

    controller.run_to_completion().expect("sweep should finish");
    assert_eq!(collaborators.analyzer.analyzed_indices(), vec![1, 2]);
}

#[test]
fn failed_job_is_recorded_and_sweep_continues() {
    let collaborators = Collaborators {
        poller: ScriptedPoller::failing([handle_for("failures", 0)]),
        ..Collaborators::default()
    };
    let mut controller =
        SweepController::start(meshcutoff_plan("failures", 2), collaborators.capabilities());

    let summary = controller.run_to_completion().expect("failures do not abort by default");

    assert_eq!(summary.phase, Phase::Done);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 2);
    let analyzed = collaborators.analyzer.analyzed();
    assert_eq!(
        analyzed[0].status,
        TerminalStatus::failure("scf did not converge")
    );
    assert_eq!(analyzed.len(), 3);
}

#[test]
fn abort_policy_stops_after_first_failed_job() {
    let collaborators = Collaborators {
        poller: ScriptedPoller::failing([handle_for("abort", 0)]),
        ..Collaborators::default()
    };
    let plan = meshcutoff_plan("abort", 1).with_failure_policy(FailurePolicy::AbortSweep);
    let mut controller = SweepController::start(plan, collaborators.capabilities());

    let error = controller.run_to_completion().expect_err("failure aborts");

    assert!(matches!(error, SweepError::JobFailed { .. }));
    assert_eq!(controller.phase(), Phase::Failed);
    assert_eq!(controller.state().cursor, 1);
    assert_eq!(collaborators.analyzer.analyzed_indices(), vec![0]);
    assert!(controller.state().failure.is_some());
}

#[test]
fn analyzer_error_is_fatal_and_stops_dispatch() {
    let collaborators = Collaborators {
        analyzer: RecordingAnalyzer::failing_on(handle_for("fatal", 0)),
        ..Collaborators::default()
    };
    let mut controller =
        SweepController::start(meshcutoff_plan("fatal", 2), collaborators.capabilities());

    let error = controller.run_to_completion().expect_err("analyzer error is fatal");

    assert!(matches!(error, SweepError::Analyze { .. }));
    assert_eq!(controller.phase(), Phase::Failed);
    assert_eq!(collaborators.launcher.launched().len(), 2);
    assert_eq!(collaborators.analyzer.analyzed_indices(), vec![0]);

    let outcomes = &controller.state().outcomes;
    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].analyzed);
    assert!(!outcomes[1].analyzed);
    assert!(controller.state().in_flight.is_empty());

    assert_eq!(controller.step().expect("terminal step is a no-op"), Phase::Failed);
    assert_eq!(collaborators.launcher.launched().len(), 2);
}

#[test]
fn cancel_while_awaiting_lets_current_batch_finish() {
    let collaborators = Collaborators::default();
    let mut controller =
        SweepController::start(meshcutoff_plan("cancel", 2), collaborators.capabilities());

    controller.begin().expect("begin");
    controller.dispatch_batch().expect("dispatch");
    controller.cancel();
    assert_eq!(controller.phase(), Phase::AwaitingBatch);

    let summary = controller.run_to_completion().expect("sweep should stop");
    assert_eq!(summary.phase, Phase::Cancelled);
    assert_eq!(collaborators.launcher.launched().len(), 2);
    assert_eq!(collaborators.analyzer.analyzed_indices(), vec![0, 1]);
}

#[test]
fn cancel_before_start_never_dispatches() {
    let collaborators = Collaborators::default();
    let mut controller =
        SweepController::start(meshcutoff_plan("early-cancel", 2), collaborators.capabilities());

    controller.cancel();
    let summary = controller.run_to_completion().expect("sweep should stop");

    assert_eq!(summary.phase, Phase::Cancelled);
    assert!(collaborators.launcher.launched().is_empty());
}

#[test]
fn abandoning_in_flight_jobs_leaves_no_handles_behind() {
    let collaborators = Collaborators::default();
    let mut controller =
        SweepController::start(meshcutoff_plan("abandon", 2), collaborators.capabilities());

    controller.begin().expect("begin");
    controller.dispatch_batch().expect("dispatch");
    let abandoned = controller.abandon_in_flight("operator request");

    assert_eq!(abandoned, vec![handle_for("abandon", 0), handle_for("abandon", 1)]);
    assert_eq!(controller.phase(), Phase::Cancelled);
    assert!(controller.state().in_flight.is_empty());
    assert!(controller.state().outcomes.iter().all(|outcome| {
        !outcome.analyzed
            && outcome.status
                == TerminalStatus::Cancelled {
                    reason: "operator request".to_string(),
                }
    }));
    assert!(collaborators.analyzer.analyzed().is_empty());
}

#[test]
fn analyzer_can_stop_the_sweep_early() {
    let collaborators = Collaborators {
        analyzer: RecordingAnalyzer::stopping_after(1),
        ..Collaborators::default()
    };
    let mut controller =
        SweepController::start(meshcutoff_plan("converged", 1), collaborators.capabilities());

    let summary = controller.run_to_completion().expect("sweep should finish");

    assert_eq!(summary.phase, Phase::Done);
    assert_eq!(summary.cursor, 1);
    assert_eq!(collaborators.launcher.launched().len(), 1);
}

#[test]
fn incomplete_poll_leaves_batch_awaiting_for_retry() {
    let collaborators = Collaborators {
        poller: ScriptedPoller::withholding_once(handle_for("retry", 1)),
        ..Collaborators::default()
    };
    let mut controller =
        SweepController::start(meshcutoff_plan("retry", 2), collaborators.capabilities());

    controller.begin().expect("begin");
    controller.dispatch_batch().expect("dispatch");
    let error = controller.await_batch().expect_err("one job still running");

    assert_eq!(
        error,
        SweepError::Poll(PollError::Incomplete {
            missing: vec![handle_for("retry", 1)],
        })
    );
    assert_eq!(controller.phase(), Phase::AwaitingBatch);
    assert_eq!(controller.state().in_flight.len(), 2);

    controller.await_batch().expect("second poll sees every job");
    assert_eq!(controller.phase(), Phase::Analyzing);
}

#[test]
fn base_inputs_are_not_mutated_by_a_sweep() {
    let collaborators = Collaborators::default();
    let plan = meshcutoff_plan("base", 3);
    let mut controller = SweepController::start(plan, collaborators.capabilities());
    controller.run_to_completion().expect("sweep should finish");

    assert_eq!(controller.plan().base_inputs(), &base_inputs());
}
