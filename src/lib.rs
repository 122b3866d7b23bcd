/*!
# Sheet Insights

A business-intelligence backend that turns uploaded spreadsheets and live
sheet connections into analysed reports, built in Rust.

## Overview

Users upload CSV or Excel files, or connect a publicly shared Google Sheets
or Excel Online workbook on a schedule. Every ingestion produces a report:
column type profiling, descriptive statistics, chart descriptors, headline
KPIs and an AI-generated narrative summary with a deterministic fallback.
Completed reports can be compared pairwise to track how metrics move over
time, and a small chat endpoint relays product questions to an AI gateway.

## Architecture

The service follows an accept-then-process design:

### HTTP Layer
- **Technologies**: axum, tower-http
- **Key Components**:
  - Report routes - upload, list, fetch, delete, compare
  - Connection routes - create, list, run, toggle, delete
  - Signed blob route - short-lived capability URLs for raw files
  - Chat route - streaming SSE relay to the AI gateway

### Processing Layer
- **Core Components**:
  - Loader - CSV and Excel parsing into headers plus rows
  - Analyzer - column typing, statistics and domain detection
  - Charts - trend, distribution and summary chart synthesis
  - Summarizer - AI narrative with a templated fallback
  - Pipeline - queued background processing with one terminal state per report
  - Scheduler - recurring live sheet fetches with change detection

### Persistence Layer
- In-memory rows snapshot to a Gzip-compressed JSON file
- Raw spreadsheet blobs on disk, scoped by owner

## Modules

- **loader**: Spreadsheet parsing (CSV quoting rules, Excel via calamine)
- **analyzer**: Column profiling and domain detection
- **charts**: Chart descriptor synthesis
- **summary**: AI summarization, fallback summaries and KPIs
- **pipeline**: Upload intake and background processing
- **scheduler**: Live sheet connections, sweeps and timeouts
- **compare**: Report-over-report KPI and findings comparison
- **chat**: Streaming chat relay
- **store**: Reports, connections, blobs and signed URLs
- **delegate**: Optional external analysis service client
- **mailer**: SMTP notifications for scheduled reports
- **app**: Routing, extractors and wiring
*/

pub mod analyzer;
pub mod app;
pub mod charts;
pub mod chat;
pub mod compare;
pub mod config;
pub mod delegate;
pub mod error;
pub mod loader;
pub mod mailer;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod summary;
