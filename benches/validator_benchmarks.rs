//! Benchmarks for the SQL security validator, which sits on every request's
//! hot path between generation and execution.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pg_gateway::config::SecurityConfig;
use pg_gateway::sql::SqlValidator;

const SIMPLE_SELECT: &str = "SELECT id, name, email FROM users WHERE created_at > '2024-01-01'";

const JOIN_QUERY: &str = "\
SELECT u.name, COUNT(o.id) AS order_count, SUM(o.total) AS revenue
FROM users u
JOIN orders o ON o.user_id = u.id
JOIN order_items oi ON oi.order_id = o.id
WHERE o.status = 'shipped'
GROUP BY u.name
HAVING COUNT(o.id) > 5
ORDER BY revenue DESC
LIMIT 100";

const CTE_QUERY: &str = "\
WITH monthly AS (
    SELECT date_trunc('month', created_at) AS month, SUM(total) AS revenue
    FROM orders
    GROUP BY 1
),
ranked AS (
    SELECT month, revenue, LAG(revenue) OVER (ORDER BY month) AS previous
    FROM monthly
)
SELECT month, revenue, revenue - previous AS delta
FROM ranked
WHERE previous IS NOT NULL";

const BLOCKED_FUNCTION: &str = "SELECT pg_sleep(10), * FROM users";

const WRITE_STATEMENT: &str = "DELETE FROM users WHERE last_login < '2020-01-01'";

fn bench_accepted_statements(c: &mut Criterion) {
    let validator = SqlValidator::new(SecurityConfig::default());

    let mut group = c.benchmark_group("validator/accepted");
    group.bench_function("simple_select", |b| {
        b.iter(|| validator.validate(black_box(SIMPLE_SELECT)));
    });
    group.bench_function("three_way_join", |b| {
        b.iter(|| validator.validate(black_box(JOIN_QUERY)));
    });
    group.bench_function("layered_cte", |b| {
        b.iter(|| validator.validate(black_box(CTE_QUERY)));
    });
    group.finish();
}

fn bench_rejected_statements(c: &mut Criterion) {
    let validator = SqlValidator::new(SecurityConfig::default());

    let mut group = c.benchmark_group("validator/rejected");
    group.bench_function("blocked_function", |b| {
        b.iter(|| validator.validate(black_box(BLOCKED_FUNCTION)));
    });
    group.bench_function("write_statement", |b| {
        b.iter(|| validator.validate(black_box(WRITE_STATEMENT)));
    });
    group.bench_function("unparseable", |b| {
        b.iter(|| validator.validate(black_box("SELECT FROM WHERE !!")));
    });
    group.finish();
}

fn bench_allow_list(c: &mut Criterion) {
    let tables: Vec<String> = (0..50).map(|i| format!("table_{i}")).collect();
    let validator = SqlValidator::new(SecurityConfig::default()).with_allowed_tables(&tables);

    c.bench_function("validator/allow_list_join", |b| {
        b.iter(|| {
            validator.validate(black_box(
                "SELECT * FROM table_1 t1 JOIN table_2 t2 ON t1.id = t2.ref_id WHERE t1.x > 10",
            ))
        });
    });
}

criterion_group!(
    benches,
    bench_accepted_statements,
    bench_rejected_statements,
    bench_allow_list
);
criterion_main!(benches);
