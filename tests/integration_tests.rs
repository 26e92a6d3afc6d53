// tests/integration_tests.rs
use grader::sandbox::memory::{MemorySandbox, Value};
use grader::sandbox::Evaluator;
use grader::{
    Feedback, FeedbackStyle, GradeError, Grader, GraderConfig, GradingSpec, PassOutcome,
};
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn sandbox_with_run(user_code: &str, value: Value) -> MemorySandbox {
    let sandbox = MemorySandbox::new();
    sandbox.prepare_scopes("prep", "result").await.unwrap();
    sandbox
        .register(user_code, move |_env| {
            let value = value.clone();
            async move { Ok(value) }
        })
        .await;
    sandbox
        .run_user_code("ex-mean", user_code, "result")
        .await
        .unwrap();
    sandbox
}

fn expected_names() -> Vec<String> {
    let mut names: Vec<String> = [
        ".engine",
        ".envir_prep",
        ".envir_result",
        ".evaluate_result",
        ".label",
        ".last_value",
        ".result",
        ".user",
        ".user_code",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_setup_binds_fixed_set_regardless_of_spec() {
    init_logging();
    let specs = vec![
        GradingSpec::with_check("TRUE"),
        GradingSpec::from_json(
            r#"{"check": "NULL", "code_check": "TRUE", "error_check": "FALSE", "solution": "mean(x)"}"#,
        )
        .unwrap(),
    ];

    for spec in specs {
        let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
        let grader = Grader::new(sandbox.clone(), spec, GraderConfig::default()).unwrap();
        grader.setup_grading().await.unwrap();

        let names = sandbox.environments().bound_names("grading").await.unwrap();
        assert_eq!(names, expected_names());

        let envs = sandbox.environments();
        assert!(matches!(envs.lookup("grading", ".engine").await.unwrap(), Some(Value::Str(s)) if s == "r"));
        assert!(matches!(envs.lookup("grading", ".label").await.unwrap(), Some(Value::Str(s)) if s == "ex-mean"));
        assert!(matches!(envs.lookup("grading", ".user_code").await.unwrap(), Some(Value::Str(s)) if s == "mean(x)"));
        for alias in [".last_value", ".result", ".user"] {
            assert!(matches!(envs.lookup("grading", alias).await.unwrap(), Some(Value::Int(3))));
        }
        assert!(matches!(
            envs.lookup("grading", ".envir_prep").await.unwrap(),
            Some(Value::Scope(scope)) if scope.label == "prep"
        ));
        assert!(matches!(
            envs.lookup("grading", ".envir_result").await.unwrap(),
            Some(Value::Scope(scope)) if scope.label == "result"
        ));
        assert!(matches!(
            envs.lookup("grading", ".evaluate_result").await.unwrap(),
            Some(Value::Object(obj))
                if obj.classes == vec!["evaluate_result".to_string()]
                    && matches!(obj.attrs.get("value"), Some(Value::Int(3)))
                    && matches!(obj.attrs.get("source"), Some(Value::Str(src)) if src == "mean(x)")
        ));
    }
}

#[tokio::test]
async fn test_grading_scope_inherits_from_result_scope() {
    let sandbox = sandbox_with_run("x", Value::Int(1)).await;
    sandbox
        .environments()
        .assign("result", "x", Value::Int(7))
        .await
        .unwrap();
    let grader = Grader::new(
        sandbox.clone(),
        GradingSpec::with_check("x"),
        GraderConfig::default(),
    )
    .unwrap();
    grader.setup_grading().await.unwrap();

    let feedback = grader.check().await.unwrap().unwrap();
    match feedback {
        Feedback::Raw(container) => assert!(matches!(container.result, Value::Int(7))),
        Feedback::Element(_) => panic!("expected raw output"),
    }
}

#[tokio::test]
async fn test_configured_aliases_are_honoured() {
    let sandbox = sandbox_with_run("answer()", Value::Int(42)).await;
    let config = GraderConfig::from_toml(r#"last_value_aliases = [".answer", ".result"]"#).unwrap();
    let grader = Grader::new(sandbox.clone(), GradingSpec::with_check("TRUE"), config).unwrap();
    grader.setup_grading().await.unwrap();

    let names = sandbox.environments().bound_names("grading").await.unwrap();
    assert!(names.contains(&".answer".to_string()));
    assert!(names.contains(&".result".to_string()));
    assert!(!names.contains(&".user".to_string()));
    assert!(!names.contains(&".last_value".to_string()));
    assert_eq!(names.len(), 8);
}

#[tokio::test]
async fn test_setup_recreates_grading_scope() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("function(env) check", |_env| async {
            Ok(Value::function(|_env| async { Ok(Value::Null) }))
        })
        .await;
    let grader = Grader::new(
        sandbox.clone(),
        GradingSpec::with_check("function(env) check"),
        GraderConfig::default(),
    )
    .unwrap();

    grader.setup_grading().await.unwrap();
    assert!(grader.check().await.unwrap().is_none());
    let names = sandbox.environments().bound_names("grading").await.unwrap();
    assert!(names.contains(&".checkFunction".to_string()));

    grader.setup_grading().await.unwrap();
    let names = sandbox.environments().bound_names("grading").await.unwrap();
    assert_eq!(names, expected_names());
}

#[tokio::test]
async fn test_setup_without_prior_run() {
    let sandbox = MemorySandbox::new();
    sandbox.prepare_scopes("prep", "result").await.unwrap();
    let grader = Grader::new(sandbox, GradingSpec::with_check("TRUE"), GraderConfig::default()).unwrap();
    assert!(matches!(grader.setup_grading().await, Err(GradeError::NoPriorRun)));
}

#[tokio::test]
async fn test_setup_with_missing_result_scope() {
    let sandbox = MemorySandbox::new();
    let grader = Grader::new(sandbox, GradingSpec::with_check("TRUE"), GraderConfig::default()).unwrap();
    let err = grader.setup_grading().await.unwrap_err();
    assert!(matches!(err, GradeError::ScopeNotFound(label) if label == "result"));
}

#[tokio::test]
async fn test_check_before_setup_fails_on_scope() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    let grader = Grader::new(
        sandbox.clone(),
        GradingSpec::with_check("TRUE"),
        GraderConfig::default(),
    )
    .unwrap();
    let err = grader.check().await.unwrap_err();
    assert!(matches!(err, GradeError::ScopeNotFound(label) if label == "grading"));
    assert_eq!(sandbox.stats().shelters_purged, 1);
}

#[tokio::test]
async fn test_shelter_released_once_on_every_path() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("fails()", |_env| async {
            Err(GradeError::Evaluation("boom".to_string()))
        })
        .await;
    sandbox
        .register("throws_inside()", |_env| async {
            Ok(Value::function(|_env| async {
                Err(GradeError::Evaluation("object 'y' not found".to_string()))
            }))
        })
        .await;
    sandbox
        .register("graded()", |_env| async { Ok(Value::grade("success", true, "OK")) })
        .await;
    sandbox
        .register("unrenderable()", |_env| async { Ok(Value::Unrenderable) })
        .await;

    let checks = [
        ("TRUE", true),
        ("NULL", true),
        ("graded()", true),
        ("fails()", false),
        ("throws_inside()", false),
        ("unrenderable()", false),
        ("not_registered()", false),
    ];

    for (i, (check, succeeds)) in checks.iter().enumerate() {
        let grader = Grader::new(
            sandbox.clone(),
            GradingSpec::with_check(*check),
            GraderConfig::default(),
        )
        .unwrap();
        grader.setup_grading().await.unwrap();
        let outcome = grader.check().await;
        assert_eq!(outcome.is_ok(), *succeeds, "check `{}`", check);

        let stats = sandbox.stats();
        assert_eq!(stats.shelters_acquired, i + 1);
        assert_eq!(stats.shelters_purged, i + 1);
    }
}

#[tokio::test]
async fn test_evaluation_errors_are_not_grades() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("stop('bad')", |_env| async {
            Err(GradeError::Evaluation("bad".to_string()))
        })
        .await;
    let grader = Grader::new(
        sandbox,
        GradingSpec::with_check("stop('bad')"),
        GraderConfig::default(),
    )
    .unwrap();
    grader.setup_grading().await.unwrap();
    assert!(matches!(grader.check().await, Err(GradeError::Evaluation(msg)) if msg == "bad"));
}

#[tokio::test]
async fn test_check_time_limit() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("slow_check", |_env| async {
            Ok(Value::function(|_env| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::grade("success", true, "too late"))
            }))
        })
        .await;
    let config = GraderConfig {
        timelimit_ms: 25,
        ..GraderConfig::default()
    };
    let grader = Grader::new(sandbox.clone(), GradingSpec::with_check("slow_check"), config).unwrap();
    assert_eq!(grader.options().timelimit, Duration::from_millis(25));

    grader.setup_grading().await.unwrap();
    let err = grader.check().await.unwrap_err();
    assert!(matches!(err, GradeError::Timeout { limit_ms: 25 }));
    assert_eq!(sandbox.stats().shelters_purged, 1);
}

#[tokio::test]
async fn test_run_pass_reports_outcome() {
    init_logging();
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("grade_mean", |_env| async {
            Ok(Value::function(|env| async move {
                let correct = matches!(env.get(".last_value"), Some(Value::Int(3)));
                let message = if correct { "Correct mean" } else { "Not the mean" };
                Ok(Value::object(
                    &["gradethis_graded"],
                    [
                        ("type", Value::str("custom")),
                        ("correct", Value::Bool(correct)),
                        ("message", Value::str(message)),
                    ],
                ))
            }))
        })
        .await;

    let grader = Grader::new(
        sandbox,
        GradingSpec::from_toml(r#"check = "grade_mean""#).unwrap(),
        GraderConfig::default(),
    )
    .unwrap();

    let (feedback, report) = grader.run_pass().await.unwrap();
    let feedback = feedback.unwrap();
    assert_eq!(
        feedback.to_html(),
        r#"<div class="alert alert-success" role="alert"><span>Correct mean</span></div>"#
    );
    assert_eq!(report.exercise, "ex-mean");
    assert_eq!(report.outcome, PassOutcome::Feedback);
    assert_eq!(report.style, Some(FeedbackStyle::Success));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["outcome"], "feedback");
    assert_eq!(json["style"], "success");
}

#[tokio::test]
async fn test_run_pass_with_raw_and_null_results() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("5 == 5", |_env| async { Ok(Value::Bool(true)) })
        .await;

    let raw = Grader::new(
        sandbox.clone(),
        GradingSpec::with_check("5 == 5"),
        GraderConfig::default(),
    )
    .unwrap();
    let (feedback, report) = raw.run_pass().await.unwrap();
    assert!(matches!(feedback, Some(Feedback::Raw(_))));
    assert_eq!(report.outcome, PassOutcome::Raw);
    assert_eq!(report.style, None);

    let none = Grader::new(sandbox, GradingSpec::with_check("NULL"), GraderConfig::default()).unwrap();
    let (feedback, report) = none.run_pass().await.unwrap();
    assert!(feedback.is_none());
    assert_eq!(report.outcome, PassOutcome::None);
}

#[tokio::test]
async fn test_grader_rejects_invalid_config() {
    let config = GraderConfig {
        last_value_aliases: Vec::new(),
        ..GraderConfig::default()
    };
    let result = Grader::new(MemorySandbox::new(), GradingSpec::with_check("TRUE"), config);
    assert!(matches!(result, Err(GradeError::Config(_))));
}

#[tokio::test]
async fn test_slow_expression_check_hits_time_limit() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox
        .register("slow_expression", |_env| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Bool(true))
        })
        .await;
    let config = GraderConfig {
        timelimit_ms: 25,
        ..GraderConfig::default()
    };
    let grader = Grader::new(
        sandbox.clone(),
        GradingSpec::with_check("slow_expression"),
        config,
    )
    .unwrap();
    grader.setup_grading().await.unwrap();

    let start = Instant::now();
    let err = grader.check().await.unwrap_err();
    assert!(matches!(err, GradeError::Timeout { limit_ms: 25 }));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(sandbox.stats().shelters_purged, 1);
}

#[tokio::test]
async fn test_failed_bind_aborts_the_pass() {
    let sandbox = sandbox_with_run("mean(x)", Value::Int(3)).await;
    sandbox.lock_binding(".envir_prep").await;
    let grader = Grader::new(
        sandbox.clone(),
        GradingSpec::with_check("TRUE"),
        GraderConfig::default(),
    )
    .unwrap();

    let err = grader.setup_grading().await.unwrap_err();
    assert!(matches!(err, GradeError::Evaluation(_)));
    let names = sandbox.environments().bound_names("grading").await.unwrap();
    assert!(!names.contains(&".envir_prep".to_string()));
    assert!(!names.contains(&".envir_result".to_string()));
    assert!(!names.contains(&".evaluate_result".to_string()));

    assert!(matches!(grader.run_pass().await, Err(GradeError::Evaluation(_))));
    let stats = sandbox.stats();
    assert_eq!(stats.shelters_acquired, 0);
    assert_eq!(stats.shelters_purged, 0);
}
