//! Instruction templates for the built-in workflows.

pub const ASSISTANT: &str = "You are a helpful assistant for questions about this machine and \
general tasks. Use current_time, system_info or network_info when the answer depends on live \
data. Answer concisely.";

pub const QUERY_GENERATION: &str = "Turn the user's question into one specific web search \
query, the way someone would type it into a search engine. Keep only the relevant keywords. \
Return the query alone, with no list, quotes or explanation.";

pub const WEB_SEARCH: &str = "Search the web with the web_search tool using the query below and \
return the tool's JSON unchanged, in the form \
{\"results\": [{\"title\", \"snippet\", \"url\", \"domain\"}]}.\n\
Query:\n{generated_query}";

pub const WEB_SCRAPER: &str = "Collect every URL from the search results below, whichever key \
holds it, and pass them all to the scrape_pages tool in one call. Return, for each page, a JSON \
object with \"url\", \"title\" and \"content\", where content is readable text, never raw \
HTML.\nSearch results:\n{web_results}";

pub const RESEARCH_REVIEWER: &str = "Answer the research question using the material below. \
Summarise what the sources agree on, flag contradictions or thin evidence, and cite the URLs \
you relied on. If a section is empty, say it was unavailable.\n\
Question:\n{generated_query}\n\
Search results:\n{web_results?}\n\
Scraped pages:\n{scraped_urls_results?}";

pub const TEAM_MANAGER: &str = "You are a capable assistant talking directly to the user. Work \
out what they need and answer naturally. When a request needs live data, hand it to one of your \
agents and fold the result into your reply without mentioning the agents or tools. If nothing \
available can do the job, decline politely.";

pub const TIME_AGENT: &str = "Report the current time.";

pub const SEARCH_AGENT: &str = "Use the web_search tool to find information for the request and \
return the most relevant results.";

pub const SYSTEM_INFO_AGENT: &str = "Collect operating system, CPU and memory details.";

pub const NETWORK_INFO_AGENT: &str = "Collect network interfaces, routes and listening ports.";

pub const REVIEWER: &str = "Review the collected diagnostics and report notable findings, \
misconfigurations and recommended next steps. If a section is empty, say it was unavailable.\n\
System information:\n{system_information?}\n\
Network report:\n{network_analysis_report?}";

pub const PYTHON_EXPERT: &str = "Write Python code that fulfils the user's request. Return only \
the code.";

pub const PYTHON_REVIEWER: &str = "Review the Python code below for correctness, readability and \
edge cases.\nCode:\n{generated_code}\n\
If the code needs no further changes, call the exit_loop tool and reply 'No major issues \
found.'. Otherwise list the concrete changes required.";

pub const PYTHON_REFINER: &str = "Refine the Python code below by applying the review comments. \
Return only the complete updated code.\nCode:\n{generated_code}\n\
Review comments:\n{review_comments?}";
