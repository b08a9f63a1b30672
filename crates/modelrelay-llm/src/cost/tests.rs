//! Tests for cost module

use super::*;
use crate::error::{Error, ErrorKind};

fn usage(provider: &str, model: &str, input: u32, output: u32, cost: f64) -> NewUsage {
    NewUsage::new(provider, model)
        .with_tokens(input, output)
        .with_cost(cost)
        .with_outcome(true, 100)
}

#[tokio::test]
async fn test_cost_tracker_record_and_stats() {
    let tracker = CostTracker::new();

    tracker
        .track(usage("huggingface", "llama", 1000, 500, 0.01))
        .await
        .unwrap();
    tracker
        .track(usage("deepseek", "deepseek-chat", 2000, 1000, 0.02))
        .await
        .unwrap();
    tracker
        .track(usage("huggingface", "llama", 500, 200, 0.0).with_outcome(false, 300))
        .await
        .unwrap();

    let stats = tracker.metrics(&UsageFilter::default()).await;

    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.successful_requests, 2);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.total_input_tokens, 3500);
    assert_eq!(stats.total_output_tokens, 1700);
    assert!((stats.total_cost - 0.03).abs() < 1e-9);
    assert_eq!(stats.avg_tokens_per_call, 2250.0);
    assert!((stats.avg_latency_ms - 500.0 / 3.0).abs() < 1e-9);
    assert_eq!(stats.by_provider["huggingface"].failed_count, 1);
}

#[tokio::test]
async fn test_missing_fields_are_rejected() {
    let tracker = CostTracker::new();

    let no_tokens = NewUsage::new("huggingface", "llama");
    assert!(matches!(
        tracker.track(no_tokens).await,
        Err(Error::Validation(_))
    ));

    let no_output = NewUsage {
        input_tokens: Some(10),
        ..NewUsage::new("huggingface", "llama")
    };
    assert!(matches!(
        tracker.track(no_output).await,
        Err(Error::Validation(_))
    ));

    let no_provider = NewUsage {
        provider: None,
        ..usage("x", "llama", 1, 1, 0.0)
    };
    assert!(matches!(
        tracker.track(no_provider).await,
        Err(Error::Validation(_))
    ));

    assert_eq!(tracker.metrics(&UsageFilter::default()).await.total_requests, 0);
}

#[tokio::test]
async fn test_filters_and_grouping() {
    let tracker = CostTracker::new();

    tracker
        .track(
            usage("huggingface", "llama", 100, 50, 0.001)
                .with_role(Some("code-generator".into()))
                .with_project(Some("alpha".into())),
        )
        .await
        .unwrap();
    tracker
        .track(
            usage("gemini", "gemini-2.5-flash", 200, 100, 0.002)
                .with_role(Some("reviewer".into()))
                .with_project(Some("alpha".into()))
                .with_fallback(1),
        )
        .await
        .unwrap();
    tracker
        .track(
            usage("huggingface", "llama", 300, 150, 0.003)
                .with_role(Some("reviewer".into()))
                .with_project(Some("beta".into())),
        )
        .await
        .unwrap();

    let hf = tracker.metrics(&UsageFilter::provider("huggingface")).await;
    assert_eq!(hf.total_requests, 2);
    assert_eq!(hf.total_tokens, 600);
    assert_eq!(hf.avg_tokens_per_call, 300.0);

    let reviewer = tracker.metrics(&UsageFilter::role("reviewer")).await;
    assert_eq!(reviewer.total_requests, 2);
    assert_eq!(reviewer.fallback_requests, 1);

    let alpha = tracker.metrics(&UsageFilter::project("alpha")).await;
    assert_eq!(alpha.by_provider.len(), 2);

    let all = tracker.metrics(&UsageFilter::default()).await;
    assert_eq!(all.by_role["reviewer"].request_count, 2);
    assert_eq!(all.by_project["beta"].total_tokens, 450);
    assert_eq!(all.by_model["llama"].request_count, 2);
}

#[tokio::test]
async fn test_averages_follow_new_records() {
    let tracker = CostTracker::new();
    tracker.track(usage("p", "m", 10, 0, 0.0)).await.unwrap();
    assert_eq!(
        tracker.metrics(&UsageFilter::default()).await.avg_tokens_per_call,
        10.0
    );

    tracker.track(usage("p", "m", 30, 0, 0.0)).await.unwrap();
    assert_eq!(
        tracker.metrics(&UsageFilter::default()).await.avg_tokens_per_call,
        20.0
    );
}

#[tokio::test]
async fn test_records_for_correlation_id() {
    let tracker = CostTracker::new();

    for id in ["call-1", "call-1", "call-2"] {
        tracker
            .track(usage("p", "m", 1, 1, 0.0).with_correlation_id(id))
            .await
            .unwrap();
    }

    assert_eq!(tracker.records_for("call-1").await.len(), 2);
    assert_eq!(tracker.records_for("call-2").await.len(), 1);
}

#[tokio::test]
async fn test_max_records_keeps_lifetime_total() {
    let tracker = CostTracker::new().with_max_records(2);
    for _ in 0..5 {
        tracker.track(usage("p", "m", 1, 1, 1.0)).await.unwrap();
    }

    assert_eq!(tracker.recent_records(10).await.len(), 2);
    assert_eq!(tracker.total_cost(), 5.0);

    let stats = tracker.metrics(&UsageFilter::default()).await;
    assert_eq!(stats.total_requests, 5);
    assert_eq!(stats.total_cost, tracker.total_cost());
    assert_eq!(stats.total_tokens, 10);

    tracker.clear().await;
    assert_eq!(tracker.total_cost(), 0.0);
    assert_eq!(tracker.metrics(&UsageFilter::default()).await.total_requests, 0);
}

#[tokio::test]
async fn test_filtered_totals_survive_trimming() {
    let tracker = CostTracker::new().with_max_records(3);
    for (provider, role) in [
        ("huggingface", "writer"),
        ("deepseek", "writer"),
        ("huggingface", "reviewer"),
        ("huggingface", "writer"),
        ("deepseek", "reviewer"),
        ("huggingface", "writer"),
    ] {
        tracker
            .track(usage(provider, "m", 100, 100, 0.5).with_role(Some(role.into())))
            .await
            .unwrap();
    }

    let hf = tracker.metrics(&UsageFilter::provider("huggingface")).await;
    assert_eq!(hf.total_requests, 4);
    assert_eq!(hf.total_cost, 2.0);
    assert_eq!(hf.by_role["writer"].request_count, 3);

    let writer = tracker.metrics(&UsageFilter::role("writer")).await;
    assert_eq!(writer.total_requests, 4);
    assert_eq!(writer.by_provider["deepseek"].total_tokens, 200);

    let report = tracker.report(&UsageFilter::default()).await;
    assert_eq!(report.stats.total_requests, 6);
    assert_eq!(report.recent_records.len(), 3);
}

#[tokio::test]
async fn test_since_filter_uses_retained_records() {
    let tracker = CostTracker::new();
    tracker.track(usage("p", "m", 1, 1, 1.0)).await.unwrap();
    let cutoff = chrono::Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    tracker.track(usage("p", "m", 2, 2, 1.0)).await.unwrap();

    let filter = UsageFilter {
        since: Some(cutoff),
        ..Default::default()
    };
    let stats = tracker.metrics(&filter).await;
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_tokens, 4);
}

#[tokio::test]
async fn test_error_records_stay_out_of_token_means() {
    let tracker = CostTracker::new();

    tracker
        .track(
            NewUsage::new("p1", "m")
                .with_failure(ErrorKind::ProviderUnavailable, 40)
                .with_correlation_id("call-1"),
        )
        .await
        .unwrap();
    tracker
        .track(
            usage("p2", "m", 50, 150, 0.2)
                .with_fallback(1)
                .with_correlation_id("call-1"),
        )
        .await
        .unwrap();

    let stats = tracker.metrics(&UsageFilter::default()).await;
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.avg_tokens_per_call, 200.0);
    assert!((stats.avg_cost_per_call - 0.2).abs() < 1e-9);
    assert_eq!(stats.by_provider["p1"].avg_tokens_per_call, 0.0);
    assert_eq!(stats.by_provider["p1"].failed_count, 1);

    let records = tracker.records_for("call-1").await;
    assert_eq!(records[0].error, Some(ErrorKind::ProviderUnavailable));
    assert!(!records[0].success);
    assert_eq!(records[0].total_tokens, 0);
    assert_eq!(records[1].error, None);
}

#[tokio::test]
async fn test_success_without_tokens_is_still_rejected() {
    let tracker = CostTracker::new();
    let claimed = NewUsage::new("p", "m").with_outcome(true, 10);
    assert!(matches!(
        tracker.track(claimed).await,
        Err(Error::Validation(_))
    ));

    let half = NewUsage {
        input_tokens: Some(3),
        ..NewUsage::new("p", "m").with_failure(ErrorKind::Timeout, 10)
    };
    assert!(matches!(
        tracker.track(half).await,
        Err(Error::Validation(_))
    ));
}

#[tokio::test]
async fn test_generate_report() {
    let tracker = CostTracker::new().with_limits(CostLimits {
        max_cost_per_call: Some(0.5),
        total_budget: Some(1.0),
    });

    tracker
        .track(usage("deepseek", "deepseek-chat", 10000, 5000, 0.75))
        .await
        .unwrap();
    tracker
        .track(usage("gemini", "gemini-2.5-pro", 20000, 10000, 0.5))
        .await
        .unwrap();
    tracker
        .track(usage("gemini", "gemini-2.5-flash", 100, 100, 0.01))
        .await
        .unwrap();

    let report = tracker.report(&UsageFilter::default()).await;

    assert_eq!(report.stats.total_requests, 3);
    assert_eq!(report.most_expensive_model.as_deref(), Some("deepseek-chat"));
    assert_eq!(report.most_used_provider.as_deref(), Some("gemini"));
    let budget = report.budget.unwrap();
    assert!(budget.exceeded);
    assert_eq!(budget.remaining, 0.0);
}

#[tokio::test]
async fn test_format_report() {
    let tracker = CostTracker::new();

    tracker
        .track(usage("huggingface", "llama", 10000, 5000, 0.01).with_role(Some("writer".into())))
        .await
        .unwrap();

    let report = tracker.report(&UsageFilter::provider("huggingface")).await;
    let formatted = format_report(&report);

    assert!(formatted.contains("Cost Report"));
    assert!(formatted.contains("Total Requests: 1"));
    assert!(formatted.contains("Provider: huggingface"));
    assert!(formatted.contains("writer"));
}

#[test]
fn test_cost_limits_validation() {
    assert!(CostLimits::default().validate().is_ok());
    let bad = CostLimits {
        max_cost_per_call: Some(-1.0),
        total_budget: None,
    };
    assert!(bad.validate().is_err());
}
