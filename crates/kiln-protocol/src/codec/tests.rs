//! Tests for the request and response codecs.

use std::collections::BTreeSet;
use std::io::Cursor;

use rstest::{fixture, rstest};
use url::Url;

use super::*;

fn uri(text: &str) -> Url {
    Url::parse(text).expect("test URI should parse")
}

#[fixture]
fn request() -> CompileRequest {
    let mut request = CompileRequest::from_args(
        "build-7",
        ["-d", "out", "src/A.java", "-Xlint:all"],
        &SourceSuffixes::default(),
    );
    request.cookie = 0x5eed_cafe;
    request.cwd = String::from("/work/project");
    request.sources_to_compile = BTreeSet::from([uri("file:///work/project/src/A.java")]);
    request.visible_sources = BTreeSet::from([
        uri("file:///work/project/src/A.java"),
        uri("file:///work/project/src/B.java"),
    ]);
    request
}

fn encode_request(request: &CompileRequest) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_request(&mut buffer, request).expect("request should encode");
    buffer
}

fn encode_response(result: &CompilationResult) -> Vec<u8> {
    let mut buffer = Vec::new();
    write_response(&mut buffer, result).expect("response should encode");
    buffer
}

#[rstest]
fn request_survives_the_wire(request: CompileRequest) {
    let bytes = encode_request(&request);
    let decoded = read_request(&mut Cursor::new(bytes), &SourceSuffixes::default())
        .expect("request should decode");
    assert_eq!(decoded, request);
}

#[rstest]
fn request_starts_with_cookie_and_ends_with_end(request: CompileRequest) {
    let text = String::from_utf8(encode_request(&request)).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.first().copied(), Some(sentinel::COOKIE));
    assert_eq!(lines.get(1).copied(), Some("1592642302"));
    assert_eq!(lines.last().copied(), Some(sentinel::END));
}

#[rstest]
fn request_payload_cannot_forge_sentinels(mut request: CompileRequest) {
    request.options.push(String::from(sentinel::END));
    request.id = String::from("line one\nline two");

    let bytes = encode_request(&request);
    let decoded = read_request(&mut Cursor::new(bytes), &SourceSuffixes::default())
        .expect("request should decode");

    assert_eq!(decoded.options.last().map(String::as_str), Some(sentinel::END));
    assert_eq!(decoded.id, "line one\nline two");
}

#[rstest]
fn truncated_request_is_rejected(request: CompileRequest) {
    let bytes = encode_request(&request);
    let text = String::from_utf8(bytes).expect("utf8");
    let truncated = text
        .strip_suffix(&format!("{}\n", sentinel::END))
        .expect("request should end with END");

    let error = read_request(&mut Cursor::new(truncated), &SourceSuffixes::default())
        .expect_err("truncated request should fail");
    assert!(matches!(error, ProtocolError::UnexpectedEof { .. }), "{error}");
}

#[rstest]
fn foreign_protocol_version_is_reported() {
    let input = "----THE-COOKIE-V1----\n1\n";
    let error = read_request(&mut Cursor::new(input), &SourceSuffixes::default())
        .expect_err("old protocol should fail");
    assert!(
        matches!(error, ProtocolError::UnsupportedVersion { ref found } if found == "----THE-COOKIE-V1----"),
        "{error}"
    );
}

#[rstest]
fn non_numeric_cookie_is_rejected() {
    let input = format!("{}\nnot-a-number\n", sentinel::COOKIE);
    let error = read_request(&mut Cursor::new(input), &SourceSuffixes::default())
        .expect_err("bad cookie should fail");
    assert!(matches!(error, ProtocolError::InvalidCookie { .. }), "{error}");
}

#[rstest]
fn out_of_order_sentinel_is_a_desync() {
    let input = format!(
        "{}\n1\n{}\n",
        sentinel::COOKIE,
        sentinel::ARGS,
    );
    let error = read_request(&mut Cursor::new(input), &SourceSuffixes::default())
        .expect_err("missing cwd should fail");
    assert!(
        matches!(error, ProtocolError::UnexpectedLine { expected, .. } if expected == sentinel::CWD),
        "{error}"
    );
}

#[rstest]
fn response_carries_packages_and_adds_baselib() {
    let mut result = CompilationResult::new(ReturnCode::Ok);
    result.stdout = String::from("compiled 2 files\n");
    result.stderr = String::from("warning: [deprecation]\n----THE-END----");
    result.package_artifacts.insert(
        String::from("demo"),
        BTreeSet::from([
            uri("file:///out/demo/A.class"),
            uri("file:///out/demo/B.class"),
        ]),
    );
    result.package_dependencies.insert(
        String::from("demo"),
        BTreeSet::from([String::from(crate::BASELIB), String::from("util")]),
    );
    result
        .package_pubapis
        .insert(String::from("demo"), String::from("TYPE demo.A\nMETHOD run()"));
    result.sys_info = SysInfo {
        num_cores: 8,
        max_memory: 1 << 30,
    };

    let decoded =
        read_response(&mut Cursor::new(encode_response(&result))).expect("response should decode");

    assert_eq!(decoded, result);
}

#[rstest]
fn response_without_dependencies_gains_baselib() {
    let mut result = CompilationResult::new(ReturnCode::Exit(1));
    result.package_artifacts.insert(
        String::from("demo"),
        BTreeSet::from([uri("file:///out/demo/A.class")]),
    );

    let decoded =
        read_response(&mut Cursor::new(encode_response(&result))).expect("response should decode");

    assert_eq!(decoded.return_code, ReturnCode::Exit(1));
    let dependencies = decoded
        .package_dependencies
        .get("demo")
        .expect("demo should have dependencies");
    assert!(dependencies.contains(crate::BASELIB));
}

#[rstest]
#[case(ReturnCode::Ok)]
#[case(ReturnCode::ErrorButTryAgain)]
#[case(ReturnCode::ErrorFatal)]
#[case(ReturnCode::Exit(3))]
fn return_code_is_preserved(#[case] code: ReturnCode) {
    let result = CompilationResult::failure(code, "diagnostic");
    let decoded =
        read_response(&mut Cursor::new(encode_response(&result))).expect("response should decode");
    assert_eq!(decoded.return_code, code);
    assert_eq!(decoded.stderr, "diagnostic");
}

#[rstest]
fn sysinfo_ignores_unknown_keys() {
    let input = format!(
        "{}\n{}\n{}\n{}\n{}\n{}\nnum_cores=4\nload=0\nmax_memory=1024\n{}\n0\n{}\n",
        sentinel::STDOUT,
        sentinel::STDERR,
        sentinel::PACKAGE_ARTIFACTS,
        sentinel::PACKAGE_DEPENDENCIES,
        sentinel::PACKAGE_PUBLIC_APIS,
        sentinel::SYSINFO,
        sentinel::RETURN_CODE,
        sentinel::END,
    );
    let decoded = read_response(&mut Cursor::new(input)).expect("response should decode");
    assert_eq!(
        decoded.sys_info,
        SysInfo {
            num_cores: 4,
            max_memory: 1024,
        }
    );
}

#[rstest]
fn entry_before_package_header_is_malformed() {
    let input = format!(
        "{}\n{}\n{}\n file:///out/A.class\n{}\n",
        sentinel::STDOUT,
        sentinel::STDERR,
        sentinel::PACKAGE_ARTIFACTS,
        sentinel::PACKAGE_DEPENDENCIES,
    );
    let error = read_response(&mut Cursor::new(input)).expect_err("orphan entry should fail");
    assert!(
        matches!(error, ProtocolError::MalformedPackageBlock { .. }),
        "{error}"
    );
}

#[rstest]
fn response_cut_short_is_rejected() {
    let input = format!("{}\nhello\n", sentinel::STDOUT);
    let error = read_response(&mut Cursor::new(input)).expect_err("short response should fail");
    assert!(matches!(error, ProtocolError::UnexpectedEof { .. }), "{error}");
}
